//! Tests against a running YugabyteDB cluster.
//!
//! Run with `DATABASE_URL=postgres://yugabyte@127.0.0.1:5433/yugabyte
//! cargo test -p locsvc-db -- --ignored`.

use std::time::Duration;

use locsvc_db::{FollowerReadExecutor, Pool, PoolConfigurationBuilder, Statement};

const SETTING: &str = "SELECT current_setting('yb_read_from_followers') AS mode";

async fn pool() -> Pool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let config = PoolConfigurationBuilder::from_url(&url)
        .unwrap()
        .load_balance(false)
        .max_connections(2)
        .min_connections(0)
        .build()
        .unwrap();
    Pool::builder(config).build().unwrap()
}

#[tokio::test]
#[ignore = "requires database"]
async fn test_follower_read_is_scoped_to_the_read() {
    let pool = pool().await;
    let executor = FollowerReadExecutor::new(pool.clone());

    let inside = executor.fetch_one(&Statement::new(SETTING)).await.unwrap();
    assert_eq!(inside.get::<String>("mode").unwrap(), "on");

    let mut conn = pool.acquire().await.unwrap();
    let after = conn.fetch_optional(SETTING, &[]).await.unwrap().unwrap();
    assert_eq!(after.get::<String>("mode").unwrap(), "off");
    conn.release().await;

    pool.close(Duration::from_secs(5)).await;
}

#[tokio::test]
#[ignore = "requires database"]
async fn test_write_inside_read_only_transaction_is_rejected() {
    let pool = pool().await;
    let mut conn = pool.acquire().await.unwrap();

    let mut tx = conn.begin_read_only().await.unwrap();
    let err = tx
        .fetch_all("CREATE TEMP TABLE locsvc_probe (id INT)", &[])
        .await
        .unwrap_err();
    assert_eq!(err.sql_state(), Some("25006"));
    tx.rollback().await.unwrap();
    conn.release().await;

    pool.close(Duration::from_secs(5)).await;
}
