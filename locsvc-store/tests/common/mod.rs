//! In-memory `address`/`location` tables behind a `MemoryCluster`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use locsvc_db::testing::{Backend, MemoryCluster};
use locsvc_db::{DbError, DbResult, Pool, PoolConfiguration, Row, SqlValue};
use locsvc_store::{Location, LocationRepository};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Stored {
    location: Location,
    active: bool,
}

/// Rows keyed by location id
#[derive(Clone, Default)]
pub struct LocationTable {
    rows: Arc<Mutex<BTreeMap<Uuid, Stored>>>,
}

impl LocationTable {
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    /// Soft-delete a row the way an operator would, outside the repository
    pub fn deactivate(&self, id: Uuid) {
        if let Some(stored) = self.rows.lock().unwrap().get_mut(&id) {
            stored.active = false;
        }
    }
}

fn text(params: &[SqlValue], i: usize) -> Option<String> {
    match params.get(i) {
        Some(SqlValue::Text(s)) => Some(s.clone()),
        _ => None,
    }
}

fn float(params: &[SqlValue], i: usize) -> Option<f64> {
    match params.get(i) {
        Some(SqlValue::Float(x)) => Some(*x),
        _ => None,
    }
}

fn int(params: &[SqlValue], i: usize) -> usize {
    match params.get(i) {
        Some(SqlValue::Int(n)) => usize::try_from(*n).unwrap_or(0),
        _ => 0,
    }
}

fn uuid(params: &[SqlValue], i: usize) -> DbResult<Uuid> {
    match params.get(i) {
        Some(SqlValue::Uuid(u)) => Ok(*u),
        other => Err(DbError::execution(
            format!("invalid input syntax for type uuid: {other:?}"),
            Some("22P02".to_string()),
        )),
    }
}

fn to_row(location: &Location) -> Row {
    Row::new()
        .with("id", location.id)
        .with("name", location.name.as_str())
        .with("description", location.description.clone())
        .with("address_id", location.address_id)
        .with("street", location.street.clone())
        .with("city", location.city.clone())
        .with("state", location.state.clone())
        .with("postal_code", location.postal_code.clone())
        .with("country", location.country.clone())
        .with("longitude", location.longitude)
        .with("latitude", location.latitude)
}

impl Backend for LocationTable {
    fn query(&self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
        let mut rows = self.rows.lock().unwrap();

        if sql.contains("INSERT INTO address") {
            let location = Location {
                id: Uuid::new_v4(),
                name: text(params, 0).unwrap_or_default(),
                description: text(params, 1),
                address_id: Some(Uuid::new_v4()),
                street: text(params, 2),
                city: text(params, 3),
                state: text(params, 4),
                postal_code: text(params, 5),
                country: text(params, 6),
                longitude: float(params, 7),
                latitude: float(params, 8),
            };
            let row = to_row(&location);
            rows.insert(
                location.id,
                Stored {
                    location,
                    active: true,
                },
            );
            return Ok(vec![row]);
        }

        if sql.contains("DELETE FROM location") {
            let id = uuid(params, 0)?;
            let deleted = i64::from(rows.remove(&id).is_some());
            return Ok(vec![Row::new().with("deleted", deleted)]);
        }

        if sql.contains("FROM location loc") && sql.contains("LIMIT") {
            let mut active: Vec<&Location> = rows
                .values()
                .filter(|s| s.active)
                .map(|s| &s.location)
                .collect();
            active.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
            return Ok(active
                .into_iter()
                .skip(int(params, 1))
                .take(int(params, 0))
                .map(to_row)
                .collect());
        }

        if sql.contains("FROM location loc") {
            let id = uuid(params, 0)?;
            return Ok(rows
                .get(&id)
                .filter(|s| s.active)
                .map(|s| to_row(&s.location))
                .into_iter()
                .collect());
        }

        Err(DbError::execution(format!("unexpected query: {sql}"), None))
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        if sql.trim_start().starts_with("CREATE") {
            return Ok(0);
        }

        if sql.contains("UPDATE location") {
            let id = uuid(params, 0)?;
            let mut rows = self.rows.lock().unwrap();
            let Some(stored) = rows.get_mut(&id).filter(|s| s.active) else {
                return Ok(0);
            };
            let location = &mut stored.location;
            location.name = text(params, 1).unwrap_or_default();
            location.description = text(params, 2);
            location.street = text(params, 3);
            location.city = text(params, 4);
            location.state = text(params, 5);
            location.postal_code = text(params, 6);
            location.country = text(params, 7);
            location.longitude = float(params, 8);
            location.latitude = float(params, 9);
            return Ok(1);
        }

        Err(DbError::execution(format!("unexpected statement: {sql}"), None))
    }
}

pub struct Harness {
    pub cluster: MemoryCluster,
    pub table: LocationTable,
    pub pool: Pool,
    pub repo: LocationRepository,
}

pub fn harness(max_connections: u32, follower_reads: bool) -> Harness {
    let table = LocationTable::default();
    let cluster = MemoryCluster::new(table.clone()).with_hosts(&[
        "10.0.1.10:5433",
        "10.0.2.10:5433",
        "10.0.3.10:5433",
    ]);
    let config = PoolConfiguration::builder()
        .hosts("10.0.1.10:5433,10.0.2.10:5433,10.0.3.10:5433")
        .load_balance(false)
        .max_connections(max_connections)
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(5))
        .follower_reads(follower_reads)
        .build()
        .unwrap();
    let pool = Pool::builder(config)
        .connector(cluster.clone())
        .build()
        .unwrap();
    let repo = LocationRepository::new(pool.clone());
    Harness {
        cluster,
        table,
        pool,
        repo,
    }
}
