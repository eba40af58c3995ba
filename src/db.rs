use anyhow::Result;
use sqlx::{Pool, Postgres};

pub type Db = Pool<Postgres>;

pub async fn connect(url: &str) -> Result<Db> {
    Ok(Pool::<Postgres>::connect(url).await?)
}
