use serde_json::Value;

use crate::api::odata::{ODataQuery, Page, PageBody};
use crate::error::ApiError;

/// How to continue after a page has been consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Advance {
    /// Follow an explicit continuation link.
    FollowLink(String),
    /// No link, full page: advance `$skip` to this value.
    AdvanceSkip(i64),
    /// Short or empty page: the collection is drained.
    Stop,
    /// Successive identical full pages without a link and with the same
    /// leading record: the server is ignoring `$skip`.
    StopSkipIgnored,
}

/// Pagination advancement, in priority order: next-link, then skip+=top on a
/// full page, then stop on a short page. The skip-ignored detector overrides
/// skip advancement when two successive link-less full pages open with the
/// same record.
pub(crate) fn advance(
    top: i64,
    skip: i64,
    page_len: usize,
    next_link: Option<&str>,
    prev_len: Option<usize>,
    prev_first_id: Option<&str>,
    first_id: Option<&str>,
) -> Advance {
    if let Some(link) = next_link {
        if !link.is_empty() {
            return Advance::FollowLink(link.to_string());
        }
    }

    if page_len == 0 || (page_len as i64) < top {
        return Advance::Stop;
    }

    if prev_len == Some(page_len)
        && first_id.is_some()
        && first_id == prev_first_id
    {
        return Advance::StopSkipIgnored;
    }

    Advance::AdvanceSkip(skip + top)
}

/// The `id` of the first record on a page, used by the skip-ignored detector.
pub(crate) fn first_record_id(items: &[Value]) -> Option<String> {
    let first = items.first()?.get("id")?;
    match first {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Mutable pagination state threaded through the lazy page stream.
#[derive(Debug)]
pub(crate) struct PaginateState {
    pub top: i64,
    pub skip: i64,
    pub filter: Option<String>,
    pub orderby: Option<String>,
    pub page_index: u64,
    pub records_seen: u64,
    pub max_pages: u64,
    pub max_records: Option<u64>,
    pub next_link: Option<String>,
    pub finished: bool,
    prev_len: Option<usize>,
    prev_first_id: Option<String>,
}

impl PaginateState {
    pub fn new(
        query: ODataQuery,
        default_top: i64,
        max_pages: u64,
        max_records: Option<u64>,
        dry_run: bool,
    ) -> Self {
        Self {
            top: query.top.unwrap_or(default_top).max(1),
            skip: query.skip.unwrap_or(0),
            filter: query.filter,
            orderby: query.orderby,
            page_index: 0,
            records_seen: 0,
            max_pages,
            max_records,
            next_link: None,
            // A dry run never issues a request; the stream is empty.
            finished: dry_run,
            prev_len: None,
            prev_first_id: None,
        }
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        ODataQuery {
            top: Some(self.top),
            skip: Some(self.skip),
            filter: self.filter.clone(),
            orderby: self.orderby.clone(),
        }
        .query_pairs()
    }

    /// Fail before issuing a request once the page cap is reached.
    pub fn check_page_cap(&self) -> Result<(), ApiError> {
        if self.page_index >= self.max_pages {
            return Err(ApiError::PaginationLimitExceeded(format!(
                "page cap of {} pages reached",
                self.max_pages
            )));
        }
        Ok(())
    }

    /// Fold a parsed body into the state, enforce the record cap, and decide
    /// how (or whether) to continue.
    pub fn observe(&mut self, body: PageBody) -> Result<Page, ApiError> {
        let page = Page {
            index: self.page_index,
            items: body.items,
            total_count: body.total_count,
            next_link: body.next_link,
        };

        self.page_index += 1;
        self.records_seen += page.items.len() as u64;

        if let Some(max) = self.max_records {
            if self.records_seen > max {
                return Err(ApiError::PaginationLimitExceeded(format!(
                    "record cap of {max} records breached at {}",
                    self.records_seen
                )));
            }
        }

        let first_id = first_record_id(&page.items);
        match advance(
            self.top,
            self.skip,
            page.items.len(),
            page.next_link.as_deref(),
            self.prev_len,
            self.prev_first_id.as_deref(),
            first_id.as_deref(),
        ) {
            Advance::FollowLink(link) => self.next_link = Some(link),
            Advance::AdvanceSkip(skip) => self.skip = skip,
            Advance::Stop => self.finished = true,
            Advance::StopSkipIgnored => {
                tracing::warn! {
                    page_index = page.index,
                    records_seen = self.records_seen,
                    "Server returned identical pages while ignoring $skip, halting pagination."
                };
                self.finished = true;
            }
        }

        self.prev_len = Some(page.items.len());
        self.prev_first_id = first_id;

        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::odata::ParseMode;
    use crate::api::odata::parse_page_body;
    use serde_json::json;

    fn body(items: Vec<Value>, next_link: Option<&str>) -> PageBody {
        PageBody {
            items,
            total_count: None,
            next_link: next_link.map(str::to_string),
        }
    }

    #[test]
    fn next_link_wins_over_skip_advancement() {
        let advanced = advance(
            100,
            0,
            100,
            Some("https://x.example.com/next"),
            None,
            None,
            Some("1"),
        );
        assert_eq!(
            advanced,
            Advance::FollowLink("https://x.example.com/next".to_string())
        );
    }

    #[test]
    fn full_page_without_link_advances_skip_by_top() {
        assert_eq!(
            advance(100, 200, 100, None, None, None, Some("1")),
            Advance::AdvanceSkip(300)
        );
    }

    #[test]
    fn short_or_empty_page_stops() {
        assert_eq!(advance(100, 0, 40, None, None, None, Some("1")), Advance::Stop);
        assert_eq!(advance(100, 0, 0, None, None, None, None), Advance::Stop);
    }

    #[test]
    fn repeated_identical_page_trips_the_skip_ignored_detector() {
        assert_eq!(
            advance(100, 100, 100, None, Some(100), Some("1"), Some("1")),
            Advance::StopSkipIgnored
        );

        // Same length but different leading record is normal progress.
        assert_eq!(
            advance(100, 100, 100, None, Some(100), Some("1"), Some("101")),
            Advance::AdvanceSkip(200)
        );
    }

    #[test]
    fn state_enforces_page_cap_before_a_request() {
        let mut state = PaginateState::new(ODataQuery::default(), 100, 2, None, false);
        assert!(state.check_page_cap().is_ok());

        state
            .observe(body(vec![json!({"id": "1"}); 100], None))
            .unwrap();
        state
            .observe(body(vec![json!({"id": "101"}); 100], None))
            .unwrap();

        assert!(matches!(
            state.check_page_cap(),
            Err(ApiError::PaginationLimitExceeded(_))
        ));
    }

    #[test]
    fn state_enforces_record_cap() {
        let mut state = PaginateState::new(ODataQuery::default(), 100, 100, Some(150), false);

        state
            .observe(body(vec![json!({"id": "1"}); 100], None))
            .unwrap();
        let err = state
            .observe(body(vec![json!({"id": "101"}); 100], None))
            .unwrap_err();

        assert!(matches!(err, ApiError::PaginationLimitExceeded(_)));
    }

    #[test]
    fn dry_run_state_is_born_finished() {
        let state = PaginateState::new(ODataQuery::default(), 100, 10, None, true);
        assert!(state.finished);
    }

    #[test]
    fn observe_round_trips_a_parsed_body() {
        let parsed = parse_page_body(
            json!({"value": [{"id": "7"}], "@odata.count": 1}),
            ParseMode::Strict,
        )
        .unwrap();

        let mut state = PaginateState::new(
            ODataQuery {
                top: Some(100),
                ..Default::default()
            },
            1000,
            10,
            None,
            false,
        );
        let page = state.observe(parsed).unwrap();

        assert_eq!(page.index, 0);
        assert_eq!(page.total_count, Some(1));
        // Short page: drained.
        assert!(state.finished);
    }
}
