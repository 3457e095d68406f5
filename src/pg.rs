use sqlx::{Pool, Postgres, postgres::PgPoolOptions};

pub async fn create_pool(postgres_url: &str) -> anyhow::Result<Pool<Postgres>> {
    Ok(PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .connect(postgres_url)
        .await?)
}

pub async fn migrate_pg(pool: &Pool<Postgres>) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;

    Ok(())
}
