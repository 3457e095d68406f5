use sqlx::Row;

use crate::catalog::CatalogStore;
use crate::error::EtlError;

/// One row of the job catalog.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobConfig {
    pub id: i64,
    pub name: String,
    pub source_endpoint: String,
    pub target_table: String,
    pub is_active: bool,
    pub requires_parameters: bool,
    pub parameter_source_table: Option<String>,
    pub parameter_source_column: Option<String>,
    /// Credential reference; doubles as the staging `source_instance_id`.
    pub source_instance_id: Option<i64>,
    pub incremental_load: bool,
    pub timestamp_field_name: String,
    pub cron_schedule: Option<String>,
    pub depends_on: Vec<i64>,
}

const JOB_COLUMNS: &str = "id, name, source_endpoint, target_table, is_active, \
     requires_parameters, parameter_source_table, parameter_source_column, \
     source_instance_id, incremental_load, timestamp_field_name, cron_schedule, \
     depends_on";

impl CatalogStore {
    pub async fn job(&self, job_id: i64) -> Result<JobConfig, EtlError> {
        let job = sqlx::query_as::<_, JobConfig>(&format!(
            "SELECT {JOB_COLUMNS} FROM etl_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        job.ok_or_else(|| EtlError::ConfigInvalid(format!("job {job_id} not found")))
    }

    pub async fn active_jobs(&self) -> Result<Vec<JobConfig>, EtlError> {
        Ok(sqlx::query_as::<_, JobConfig>(&format!(
            "SELECT {JOB_COLUMNS} FROM etl_jobs WHERE is_active ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?)
    }

    /// Active jobs carrying a cron expression, for the scheduler.
    pub async fn scheduled_jobs(&self) -> Result<Vec<JobConfig>, EtlError> {
        Ok(sqlx::query_as::<_, JobConfig>(&format!(
            "SELECT {JOB_COLUMNS} FROM etl_jobs \
             WHERE is_active AND cron_schedule IS NOT NULL AND cron_schedule <> '' \
             ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?)
    }

    /// Dependency arcs `(dependency, dependent)` over the active catalog.
    pub async fn dependency_arcs(&self) -> Result<Vec<(i64, i64)>, EtlError> {
        let jobs = self.active_jobs().await?;
        let mut arcs = Vec::new();
        for job in &jobs {
            for dep in &job.depends_on {
                arcs.push((*dep, job.id));
            }
        }
        Ok(arcs)
    }

    /// Distinct, non-null parameter values from a referenced table, cast to
    /// text and sorted ascending so checkpoint indices stay stable across
    /// restarts.
    pub async fn parameter_values(
        &self,
        source_table: &str,
        source_column: &str,
    ) -> Result<Vec<String>, EtlError> {
        let table = validate_identifier(source_table)?;
        let column = column_expression(source_column)?;

        let sql = format!(
            "SELECT DISTINCT ({column})::text AS value FROM {table} \
             WHERE ({column}) IS NOT NULL ORDER BY 1"
        );

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            values.push(row.try_get::<String, _>("value")?);
        }
        Ok(values)
    }
}

/// Accept only plain SQL identifiers; everything else is rejected before it
/// can reach a query string.
pub(crate) fn validate_identifier(name: &str) -> Result<&str, EtlError> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_head && valid_tail && name.len() <= 63 {
        Ok(name)
    } else {
        Err(EtlError::ConfigInvalid(format!(
            "invalid SQL identifier: {name:?}"
        )))
    }
}

/// Validate a parameter-source column: either a plain column or a JSONB path
/// like `data->>'patientId'` / `data->'visit'->>'id'`. Returns the
/// canonicalized expression.
pub(crate) fn column_expression(column: &str) -> Result<String, EtlError> {
    if !column.contains("->") {
        return Ok(validate_identifier(column)?.to_string());
    }

    let invalid = || EtlError::ConfigInvalid(format!("invalid JSONB path: {column:?}"));

    let mut rest = column;
    let head_len = rest.find("->").ok_or_else(invalid)?;
    let head = validate_identifier(&rest[..head_len]).map_err(|_| invalid())?;
    let mut expr = head.to_string();
    rest = &rest[head_len..];

    while !rest.is_empty() {
        let arrow = if let Some(tail) = rest.strip_prefix("->>") {
            rest = tail;
            "->>"
        } else if let Some(tail) = rest.strip_prefix("->") {
            rest = tail;
            "->"
        } else {
            return Err(invalid());
        };

        let key = rest.strip_prefix('\'').ok_or_else(invalid)?;
        let close = key.find('\'').ok_or_else(invalid)?;
        let name = &key[..close];
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid());
        }

        expr.push_str(arrow);
        expr.push('\'');
        expr.push_str(name);
        expr.push('\'');
        rest = &key[close + 1..];
    }

    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_identifiers_pass_and_injection_fails() {
        assert!(validate_identifier("dim_studies_staging").is_ok());
        assert!(validate_identifier("_tmp2").is_ok());

        assert!(validate_identifier("studies; DROP TABLE x").is_err());
        assert!(validate_identifier("bad-name").is_err());
        assert!(validate_identifier("1starts_with_digit").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn json_paths_are_canonicalized() {
        assert_eq!(
            column_expression("data->>'patientId'").unwrap(),
            "data->>'patientId'"
        );
        assert_eq!(
            column_expression("data->'visit'->>'id'").unwrap(),
            "data->'visit'->>'id'"
        );
        assert_eq!(column_expression("patient_id").unwrap(), "patient_id");
    }

    #[test]
    fn malformed_paths_are_rejected() {
        assert!(column_expression("data->>'id' OR 1=1").is_err());
        assert!(column_expression("data->>patientId").is_err());
        assert!(column_expression("data->>''").is_err());
        assert!(column_expression("data->").is_err());
    }
}
