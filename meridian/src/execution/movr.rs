//! # Summary
//!
//! This module implements the MovR execution engine: ride-sharing
//! procedures over bincode-encoded rows. Every procedure runs in three
//! steps — read its rows from the pre-image, compute, stage its writes —
//! and surfaces the first failure as the transaction's abort reason.
//!
//! Row keys lead with an 8-byte little-endian global id whose top 16 bits
//! are the city index, followed by a table tag byte; the leading id is what
//! the MovR metadata initializer and the sharder both key on.

use serde_derive::{Deserialize, Serialize};

use crate::config::fnv1a;
use crate::transaction::{Key, Transaction};

use super::{read_declared, stage_write, Execution, ProcedureId, ReadView};

/// Cities in the generated world; city names hash onto this range.
pub const NUM_CITIES: u64 = 1000;

pub const VEHICLE_STATUS_AVAILABLE: &str = "available";
pub const VEHICLE_STATUS_IN_USE: &str = "in_use";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MovrTable {
    Users = 1,
    Vehicles = 2,
    Rides = 3,
    VehicleLocationHistories = 4,
    UserPromoCodes = 5,
}

/// Stable city index derived from the city name.
pub fn city_index(city: &str) -> u64 {
    fnv1a(city.as_bytes()) % NUM_CITIES
}

/// Row key: `[global_id: u64 LE][table tag]` where the global id embeds the
/// city index in its top 16 bits.
pub fn movr_key(table: MovrTable, city: &str, id: u64) -> Key {
    let global_id = (city_index(city) << 48) | (id & 0x0000_ffff_ffff_ffff);
    let mut key = global_id.to_le_bytes().to_vec();
    key.push(table as u8);
    key
}

/// Synthetic row id for a location history entry, unique per
/// `(ride, timestamp)`.
pub fn history_id(ride_id: u64, timestamp: i64) -> u64 {
    (ride_id << 24) | (timestamp as u64 & 0x00ff_ffff)
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
struct UserRow {
    id: u64,
    city: String,
    name: String,
    address: String,
    credit_card: String,
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
struct VehicleRow {
    id: u64,
    city: String,
    vehicle_type: String,
    owner_id: u64,
    creation_time: i64,
    status: String,
    current_location: String,
    ext: String,
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
struct RideRow {
    id: u64,
    city: String,
    vehicle_id: u64,
    rider_id: u64,
    start_address: String,
    end_address: String,
    start_time: i64,
    end_time: i64,
    revenue: f64,
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
struct LocationHistoryRow {
    city: String,
    ride_id: u64,
    timestamp: i64,
    lat: f64,
    lon: f64,
}

#[derive(Serialize, Deserialize)]
#[derive(Clone, Debug)]
struct UserPromoCodeRow {
    city: String,
    user_id: u64,
    code: String,
    usage_count: u64,
}

pub struct MovrExecution;

impl MovrExecution {
    pub fn new() -> Self {
        MovrExecution
    }
}

fn parse_u64(arg: &str, what: &str) -> Result<u64, String> {
    arg.parse::<u64>().map_err(|_| format!("invalid {}: {}", what, arg))
}

fn parse_i64(arg: &str, what: &str) -> Result<i64, String> {
    arg.parse::<i64>().map_err(|_| format!("invalid {}: {}", what, arg))
}

fn parse_f64(arg: &str, what: &str) -> Result<f64, String> {
    arg.parse::<f64>().map_err(|_| format!("invalid {}: {}", what, arg))
}

fn read_row<R: serde::de::DeserializeOwned>(
    txn: &Transaction,
    view: &ReadView,
    key: &[u8],
    what: &str,
) -> Result<R, String> {
    let bytes = read_declared(txn, view, key)?.ok_or_else(|| format!("{} not found", what))?;
    bincode::deserialize(bytes).map_err(|_| format!("corrupt {} row", what))
}

fn write_row<R: serde::Serialize>(txn: &mut Transaction, key: Key, row: &R) -> Result<(), String> {
    let bytes = bincode::serialize(row).map_err(|_| "unserializable row".to_string())?;
    stage_write(txn, key, bytes)
}

impl Execution for MovrExecution {
    fn execute(&self, txn: &mut Transaction, view: &ReadView) {
        let code = txn.code.clone();
        for proc in &code {
            let result = match proc.id {
            | ProcedureId::ViewVehicles => view_vehicles(txn, view, &proc.args),
            | ProcedureId::UserSignup => user_signup(txn, &proc.args),
            | ProcedureId::AddVehicle => add_vehicle(txn, view, &proc.args),
            | ProcedureId::StartRide => start_ride(txn, view, &proc.args),
            | ProcedureId::UpdateLocation => update_location(txn, &proc.args),
            | ProcedureId::EndRide => end_ride(txn, view, &proc.args),
            | other => Err(format!("{}: not a MovR procedure", other.name())),
            };
            if let Err(error) = result {
                error!("{} failed: {}", proc.id.name(), error);
                txn.abort(format!("{} Txn - {}", proc.id.name(), error));
                return;
            }
        }
    }
}

/// `view_vehicles city id...` — read each vehicle and report its status.
fn view_vehicles(txn: &mut Transaction, view: &ReadView, args: &[String]) -> Result<(), String> {
    let city = &args[0];
    for arg in &args[1..] {
        let vehicle_id = parse_u64(arg, "vehicle id")?;
        let key = movr_key(MovrTable::Vehicles, city, vehicle_id);
        let row: VehicleRow = read_row(txn, view, &key, "vehicle")?;
        let report = format!("{}:{}", row.id, row.status);
        txn.reads.push((key, report.into_bytes()));
    }
    Ok(())
}

/// `user_signup user_id city name address credit_card`
fn user_signup(txn: &mut Transaction, args: &[String]) -> Result<(), String> {
    let row = UserRow {
        id: parse_u64(&args[0], "user id")?,
        city: args[1].clone(),
        name: args[2].clone(),
        address: args[3].clone(),
        credit_card: args[4].clone(),
    };
    let key = movr_key(MovrTable::Users, &row.city, row.id);
    write_row(txn, key, &row)
}

/// `add_vehicle vehicle_id home_city type owner_id owner_city creation_time
/// status current_location ext` — the owner must exist.
fn add_vehicle(txn: &mut Transaction, view: &ReadView, args: &[String]) -> Result<(), String> {
    let vehicle_id = parse_u64(&args[0], "vehicle id")?;
    let home_city = &args[1];
    let owner_id = parse_u64(&args[3], "owner id")?;
    let owner_city = &args[4];

    let owner_key = movr_key(MovrTable::Users, owner_city, owner_id);
    let _owner: UserRow = read_row(txn, view, &owner_key, "owner")?;

    let row = VehicleRow {
        id: vehicle_id,
        city: home_city.clone(),
        vehicle_type: args[2].clone(),
        owner_id,
        creation_time: parse_i64(&args[5], "creation time")?,
        status: args[6].clone(),
        current_location: args[7].clone(),
        ext: args[8].clone(),
    };
    let key = movr_key(MovrTable::Vehicles, home_city, vehicle_id);
    write_row(txn, key, &row)
}

/// `start_ride user_id user_city code vehicle_id vehicle_city ride_id
/// home_city start_address start_time` — the vehicle must be available;
/// a non-empty promo code has its usage counted.
fn start_ride(txn: &mut Transaction, view: &ReadView, args: &[String]) -> Result<(), String> {
    let user_id = parse_u64(&args[0], "user id")?;
    let user_city = &args[1];
    let code = &args[2];
    let vehicle_id = parse_u64(&args[3], "vehicle id")?;
    let vehicle_city = &args[4];
    let ride_id = parse_u64(&args[5], "ride id")?;
    let home_city = &args[6];

    let user_key = movr_key(MovrTable::Users, user_city, user_id);
    let _user: UserRow = read_row(txn, view, &user_key, "user")?;

    let vehicle_key = movr_key(MovrTable::Vehicles, vehicle_city, vehicle_id);
    let mut vehicle: VehicleRow = read_row(txn, view, &vehicle_key, "vehicle")?;
    if vehicle.status != VEHICLE_STATUS_AVAILABLE {
        return Err(format!("vehicle {} not available", vehicle_id));
    }
    vehicle.status = VEHICLE_STATUS_IN_USE.to_string();

    if !code.is_empty() {
        let promo_key = movr_key(MovrTable::UserPromoCodes, user_city, user_id);
        let mut promo: UserPromoCodeRow = read_row(txn, view, &promo_key, "promo code")?;
        promo.usage_count += 1;
        write_row(txn, promo_key, &promo)?;
    }

    let ride = RideRow {
        id: ride_id,
        city: home_city.clone(),
        vehicle_id,
        rider_id: user_id,
        start_address: args[7].clone(),
        end_address: String::new(),
        start_time: parse_i64(&args[8], "start time")?,
        end_time: 0,
        revenue: 0.0,
    };
    write_row(txn, vehicle_key, &vehicle)?;
    let ride_key = movr_key(MovrTable::Rides, home_city, ride_id);
    write_row(txn, ride_key, &ride)
}

/// `update_location city ride_id timestamp lat lon`
fn update_location(txn: &mut Transaction, args: &[String]) -> Result<(), String> {
    let row = LocationHistoryRow {
        city: args[0].clone(),
        ride_id: parse_u64(&args[1], "ride id")?,
        timestamp: parse_i64(&args[2], "timestamp")?,
        lat: parse_f64(&args[3], "latitude")?,
        lon: parse_f64(&args[4], "longitude")?,
    };
    let key = movr_key(
        MovrTable::VehicleLocationHistories,
        &row.city,
        history_id(row.ride_id, row.timestamp),
    );
    write_row(txn, key, &row)
}

/// `end_ride ride_id home_city vehicle_id vehicle_city end_address end_time
/// revenue` — the ride must exist and its vehicle must be in use.
fn end_ride(txn: &mut Transaction, view: &ReadView, args: &[String]) -> Result<(), String> {
    let ride_id = parse_u64(&args[0], "ride id")?;
    let home_city = &args[1];
    let vehicle_id = parse_u64(&args[2], "vehicle id")?;
    let vehicle_city = &args[3];

    let ride_key = movr_key(MovrTable::Rides, home_city, ride_id);
    let mut ride: RideRow = read_row(txn, view, &ride_key, "ride")?;

    let vehicle_key = movr_key(MovrTable::Vehicles, vehicle_city, vehicle_id);
    let mut vehicle: VehicleRow = read_row(txn, view, &vehicle_key, "vehicle")?;
    if vehicle.status != VEHICLE_STATUS_IN_USE {
        return Err(format!("vehicle {} not in use", vehicle_id));
    }

    vehicle.status = VEHICLE_STATUS_AVAILABLE.to_string();
    vehicle.current_location = args[4].clone();
    ride.end_address = args[4].clone();
    ride.end_time = parse_i64(&args[5], "end time")?;
    ride.revenue = parse_f64(&args[6], "revenue")?;

    write_row(txn, vehicle_key, &vehicle)?;
    write_row(txn, ride_key, &ride)
}

#[cfg(test)]
mod tests {
    use std::convert::TryInto;

    use super::*;
    use crate::execution::parse_code;
    use crate::transaction::{KeyMode, TxnStatus};

    fn encode<R: serde::Serialize>(row: &R) -> Option<Vec<u8>> {
        Some(bincode::serialize(row).unwrap())
    }

    fn run(txn: &mut Transaction, view: ReadView) {
        MovrExecution::new().execute(txn, &view);
    }

    #[test]
    fn signup_then_start_and_end_ride() {
        let city = "seattle";
        let user_key = movr_key(MovrTable::Users, city, 1);
        let vehicle_key = movr_key(MovrTable::Vehicles, city, 2);
        let ride_key = movr_key(MovrTable::Rides, city, 3);

        let user = UserRow {
            id: 1,
            city: city.to_string(),
            name: "ada".to_string(),
            address: "1 pike st".to_string(),
            credit_card: "4111".to_string(),
        };
        let vehicle = VehicleRow {
            id: 2,
            city: city.to_string(),
            vehicle_type: "bike".to_string(),
            owner_id: 1,
            creation_time: 0,
            status: VEHICLE_STATUS_AVAILABLE.to_string(),
            current_location: "1 pike st".to_string(),
            ext: String::new(),
        };

        let code = parse_code(&[vec![
            "start_ride".to_string(),
            "1".to_string(),
            city.to_string(),
            String::new(),
            "2".to_string(),
            city.to_string(),
            "3".to_string(),
            city.to_string(),
            "1 pike st".to_string(),
            "100".to_string(),
        ]])
        .unwrap();
        let mut txn = Transaction::new(
            vec![
                (user_key.clone(), KeyMode::Read),
                (vehicle_key.clone(), KeyMode::Write),
                (ride_key.clone(), KeyMode::Write),
            ],
            code,
        );
        let view = ReadView::new(vec![
            (user_key, encode(&user)),
            (vehicle_key.clone(), encode(&vehicle)),
            (ride_key.clone(), None),
        ]);
        run(&mut txn, view);

        assert_eq!(txn.status, TxnStatus::Pending, "{}", txn.abort_reason);
        let written_vehicle = txn
            .writes
            .iter()
            .find(|(k, _)| *k == vehicle_key)
            .map(|(_, v)| bincode::deserialize::<VehicleRow>(v).unwrap())
            .unwrap();
        assert_eq!(written_vehicle.status, VEHICLE_STATUS_IN_USE);

        // End the ride over the post-start state.
        let ride: RideRow = txn
            .writes
            .iter()
            .find(|(k, _)| *k == ride_key)
            .map(|(_, v)| bincode::deserialize(v).unwrap())
            .unwrap();
        let code = parse_code(&[vec![
            "end_ride".to_string(),
            "3".to_string(),
            city.to_string(),
            "2".to_string(),
            city.to_string(),
            "2 pine st".to_string(),
            "200".to_string(),
            "12.5".to_string(),
        ]])
        .unwrap();
        let mut end = Transaction::new(
            vec![
                (vehicle_key.clone(), KeyMode::Write),
                (ride_key.clone(), KeyMode::Write),
            ],
            code,
        );
        let view = ReadView::new(vec![
            (vehicle_key.clone(), encode(&written_vehicle)),
            (ride_key.clone(), encode(&ride)),
        ]);
        run(&mut end, view);

        assert_eq!(end.status, TxnStatus::Pending, "{}", end.abort_reason);
        let ended: RideRow = end
            .writes
            .iter()
            .find(|(k, _)| *k == ride_key)
            .map(|(_, v)| bincode::deserialize(v).unwrap())
            .unwrap();
        assert_eq!(ended.end_address, "2 pine st");
        assert!((ended.revenue - 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn start_ride_of_busy_vehicle_aborts() {
        let city = "boston";
        let user_key = movr_key(MovrTable::Users, city, 1);
        let vehicle_key = movr_key(MovrTable::Vehicles, city, 2);
        let ride_key = movr_key(MovrTable::Rides, city, 3);
        let user = UserRow {
            id: 1,
            city: city.to_string(),
            name: "bob".to_string(),
            address: String::new(),
            credit_card: String::new(),
        };
        let vehicle = VehicleRow {
            id: 2,
            city: city.to_string(),
            vehicle_type: "scooter".to_string(),
            owner_id: 1,
            creation_time: 0,
            status: VEHICLE_STATUS_IN_USE.to_string(),
            current_location: String::new(),
            ext: String::new(),
        };
        let code = parse_code(&[vec![
            "start_ride".to_string(),
            "1".to_string(),
            city.to_string(),
            String::new(),
            "2".to_string(),
            city.to_string(),
            "3".to_string(),
            city.to_string(),
            "x".to_string(),
            "0".to_string(),
        ]])
        .unwrap();
        let mut txn = Transaction::new(
            vec![
                (user_key.clone(), KeyMode::Read),
                (vehicle_key.clone(), KeyMode::Write),
                (ride_key.clone(), KeyMode::Write),
            ],
            code,
        );
        let view = ReadView::new(vec![
            (user_key, encode(&user)),
            (vehicle_key, encode(&vehicle)),
            (ride_key, None),
        ]);
        run(&mut txn, view);
        assert_eq!(txn.status, TxnStatus::Aborted);
        assert!(txn.abort_reason.contains("not available"));
    }

    #[test]
    fn user_signup_writes_one_row() {
        let city = "austin";
        let key = movr_key(MovrTable::Users, city, 9);
        let code = parse_code(&[vec![
            "user_signup".to_string(),
            "9".to_string(),
            city.to_string(),
            "eve".to_string(),
            "9 elm st".to_string(),
            "4242".to_string(),
        ]])
        .unwrap();
        let mut txn = Transaction::new(vec![(key.clone(), KeyMode::Write)], code);
        run(&mut txn, ReadView::new(vec![(key.clone(), None)]));
        assert_eq!(txn.status, TxnStatus::Pending, "{}", txn.abort_reason);
        assert_eq!(txn.writes.len(), 1);
        let row: UserRow = bincode::deserialize(&txn.writes[0].1).unwrap();
        assert_eq!(row.name, "eve");
    }

    #[test]
    fn keys_embed_city_index() {
        let key = movr_key(MovrTable::Vehicles, "seattle", 5);
        assert_eq!(key.len(), 9);
        let global_id = u64::from_le_bytes(key[..8].try_into().unwrap());
        assert_eq!(global_id >> 48, city_index("seattle"));
        assert_eq!(global_id & 0x0000_ffff_ffff_ffff, 5);
    }
}
