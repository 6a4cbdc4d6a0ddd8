//! Location repository.
//!
//! - create / update / delete: one statement each on the primary, so the
//!   location and its address change together
//! - get / list: follower-read path (read-only transaction, replica reads
//!   allowed when the pool has follower reads on)

use locsvc_db::{DbError, DbResult, FollowerReadExecutor, Pool, Statement};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::models::{Location, NewLocation};

/// Location repository
#[derive(Debug, Clone)]
pub struct LocationRepository {
    executor: FollowerReadExecutor,
}

impl LocationRepository {
    pub fn new(pool: Pool) -> Self {
        Self {
            executor: FollowerReadExecutor::new(pool),
        }
    }

    pub fn executor(&self) -> &FollowerReadExecutor {
        &self.executor
    }

    /// Create the tables if they do not exist yet
    pub async fn ensure_schema(&self) -> DbResult<()> {
        crate::schema::ensure_schema(&self.executor).await
    }

    /// Insert the address and the location in a single statement.
    ///
    /// Returns the stored row, including the generated identifiers.
    #[instrument(skip_all, fields(name = %location.name))]
    pub async fn create_location(&self, location: &NewLocation) -> DbResult<Location> {
        let stmt = Statement::new(
            r#"
            WITH adr AS (
                INSERT INTO address (street, city, state_cd, postal_cd, country_cd, longitude, latitude)
                VALUES ($3, $4, $5, $6, $7, $8, $9)
                RETURNING id, street, city, state_cd, postal_cd, country_cd, longitude, latitude
            ),
            loc AS (
                INSERT INTO location (name, description, address_id)
                SELECT $1, $2, adr.id FROM adr
                RETURNING id, name, description, address_id
            )
            SELECT loc.id, loc.name, loc.description, adr.id AS address_id,
                   adr.street, adr.city, adr.state_cd AS state, adr.postal_cd AS postal_code,
                   adr.country_cd AS country, adr.longitude, adr.latitude
            FROM loc
            JOIN adr ON adr.id = loc.address_id
            "#,
        )
        .bind(location.name.as_str())
        .bind(location.description.as_deref())
        .bind(location.street.as_deref())
        .bind(location.city.as_deref())
        .bind(location.state.as_deref())
        .bind(location.postal_code.as_deref())
        .bind(location.country.as_deref())
        .bind(location.longitude)
        .bind(location.latitude);

        let row = self.executor.execute_returning(&stmt).await?;
        let created = Location::from_row(&row)?;
        debug!(id = %created.id, "location created");
        Ok(created)
    }

    /// Read one active location through the follower-read path
    #[instrument(skip(self))]
    pub async fn get_location_by_id(&self, id: Uuid) -> DbResult<Location> {
        let stmt = Statement::new(
            r#"
            SELECT loc.id, loc.name, loc.description, adr.id AS address_id,
                   adr.street, adr.city, adr.state_cd AS state, adr.postal_cd AS postal_code,
                   adr.country_cd AS country, adr.longitude, adr.latitude
            FROM location loc
            LEFT JOIN address adr ON loc.address_id = adr.id
            WHERE loc.id = $1
              AND loc.active = true
            "#,
        )
        .bind(id)
        .describing("location", id);

        let row = self.executor.fetch_one(&stmt).await?;
        Location::from_row(&row)
    }

    /// Page through active locations by name; an empty page is not an error
    #[instrument(skip(self))]
    pub async fn list_locations(&self, limit: u32, offset: u32) -> DbResult<Vec<Location>> {
        let stmt = Statement::new(
            r#"
            SELECT loc.id, loc.name, loc.description, adr.id AS address_id,
                   adr.street, adr.city, adr.state_cd AS state, adr.postal_cd AS postal_code,
                   adr.country_cd AS country, adr.longitude, adr.latitude
            FROM location loc
            LEFT JOIN address adr ON loc.address_id = adr.id
            WHERE loc.active = true
            ORDER BY loc.name, loc.id
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(i64::from(limit))
        .bind(i64::from(offset));

        self.executor
            .fetch_all(&stmt)
            .await?
            .iter()
            .map(Location::from_row)
            .collect()
    }

    /// Replace the location's fields and its address.
    ///
    /// Returns the number of locations updated; `NotFound` when none was.
    #[instrument(skip(self, location))]
    pub async fn update_location(&self, id: Uuid, location: &NewLocation) -> DbResult<u64> {
        let stmt = Statement::new(
            r#"
            WITH adr AS (
                UPDATE address
                SET street = $4, city = $5, state_cd = $6, postal_cd = $7,
                    country_cd = $8, longitude = $9, latitude = $10
                WHERE id = (SELECT address_id FROM location WHERE id = $1 AND active = true)
            )
            UPDATE location
            SET name = $2, description = $3
            WHERE id = $1
              AND active = true
            "#,
        )
        .bind(id)
        .bind(location.name.as_str())
        .bind(location.description.as_deref())
        .bind(location.street.as_deref())
        .bind(location.city.as_deref())
        .bind(location.state.as_deref())
        .bind(location.postal_code.as_deref())
        .bind(location.country.as_deref())
        .bind(location.longitude)
        .bind(location.latitude);

        let updated = self.executor.execute(&stmt).await?;
        if updated == 0 {
            return Err(location_not_found(id));
        }
        Ok(updated)
    }

    /// Delete the location and its address.
    ///
    /// Returns the number of locations deleted; `NotFound` when none was.
    #[instrument(skip(self))]
    pub async fn delete_location(&self, id: Uuid) -> DbResult<u64> {
        let stmt = Statement::new(
            r#"
            WITH loc AS (
                DELETE FROM location WHERE id = $1
                RETURNING address_id
            ),
            adr AS (
                DELETE FROM address WHERE id IN (SELECT address_id FROM loc)
            )
            SELECT count(*) AS deleted FROM loc
            "#,
        )
        .bind(id)
        .describing("location", id);

        let deleted: i64 = self.executor.execute_returning(&stmt).await?.get("deleted")?;
        if deleted == 0 {
            return Err(location_not_found(id));
        }
        Ok(deleted.unsigned_abs())
    }
}

fn location_not_found(id: Uuid) -> DbError {
    DbError::not_found("location", id.to_string())
}
