//! Table bootstrap for the location store.

use locsvc_db::{DbResult, FollowerReadExecutor, Statement};
use tracing::info;

const DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS address (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        street TEXT,
        city TEXT,
        state_cd TEXT,
        postal_cd TEXT,
        country_cd TEXT,
        longitude DOUBLE PRECISION,
        latitude DOUBLE PRECISION
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS location (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        name TEXT NOT NULL,
        description TEXT,
        address_id UUID REFERENCES address (id),
        active BOOLEAN NOT NULL DEFAULT true,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS location_active_name_idx ON location (name) WHERE active",
];

/// Create the `address` and `location` tables on the primary
pub async fn ensure_schema(executor: &FollowerReadExecutor) -> DbResult<()> {
    for ddl in DDL {
        executor.execute(&Statement::new(ddl)).await?;
    }
    info!(statements = DDL.len(), "location schema ensured");
    Ok(())
}
