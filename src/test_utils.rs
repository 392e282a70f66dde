use crate::graph::KeySet;
use chrono::NaiveDate;
use gtfs_structures::*;
use std::collections::BTreeSet;

pub fn set(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|v| v.to_string()).collect()
}

pub fn keys(entries: &[(EntityType, &str)]) -> KeySet {
    let mut keys = KeySet::new();
    for (entity_type, key) in entries {
        keys.entry(*entity_type).or_default().insert(key.to_string());
    }
    keys
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn route(id: &str) -> Route {
    Route {
        id: id.to_owned(),
        short_name: id.to_owned(),
        ..Route::default()
    }
}

pub fn trip(id: &str, route_id: &str, service_id: &str, shape_id: Option<&str>) -> Trip {
    Trip {
        id: id.to_owned(),
        route_id: route_id.to_owned(),
        service_id: service_id.to_owned(),
        shape_id: shape_id.map(str::to_owned),
        ..Trip::default()
    }
}

pub fn stop(id: &str, parent_station: Option<&str>) -> Stop {
    Stop {
        id: id.to_owned(),
        name: id.to_owned(),
        parent_station: parent_station.map(str::to_owned),
        ..Stop::default()
    }
}

pub fn stop_time(trip_id: &str, stop_id: &str, stop_sequence: u32) -> StopTime {
    StopTime {
        trip_id: trip_id.to_owned(),
        stop_id: stop_id.to_owned(),
        stop_sequence,
        arrival_time: Some(8 * 3600 + stop_sequence * 60),
        departure_time: Some(8 * 3600 + stop_sequence * 60),
        ..StopTime::default()
    }
}

pub fn shape_point(id: &str, sequence: u32) -> ShapePoint {
    ShapePoint {
        id: id.to_owned(),
        latitude: 48.8 + f64::from(sequence) / 100.,
        longitude: 2.3,
        sequence,
        ..ShapePoint::default()
    }
}

pub fn calendar_date(service_id: &str, date: NaiveDate, exception_type: Exception) -> CalendarDate {
    CalendarDate {
        service_id: service_id.to_owned(),
        date,
        exception_type,
    }
}

pub fn fare(id: &str) -> FareAttribute {
    FareAttribute {
        id: id.to_owned(),
        price: "1.50".to_owned(),
        currency: "EUR".to_owned(),
        payment_method: PaymentMethod::Aboard,
        transfers: None,
        agency_id: None,
        transfer_duration: None,
    }
}

pub fn fare_rule(fare_id: &str, route_id: Option<&str>) -> FareRule {
    FareRule {
        fare_id: fare_id.to_owned(),
        route_id: route_id.map(str::to_owned),
        ..FareRule::default()
    }
}

/// Two routes sharing the stop `s2`, every edge of the graph used at least once
///
/// - r1: t1 (weekdays, sh1) calling at s1, s2; fare rule for `fare`
/// - r2: t2 (holidays, no shape) calling at s2, s3
/// - s1 and s2 belong to `station`
/// - `holidays` is only defined in calendar_dates.txt
/// - `zone_fare` has a rule without route
pub fn sample_feed() -> Feed {
    Feed {
        routes: vec![route("r1"), route("r2")],
        trips: vec![
            trip("t1", "r1", "weekdays", Some("sh1")),
            trip("t2", "r2", "holidays", None),
        ],
        stops: vec![
            Stop {
                location_type: LocationType::StopArea,
                ..stop("station", None)
            },
            stop("s1", Some("station")),
            stop("s2", Some("station")),
            stop("s3", None),
        ],
        stop_times: vec![
            stop_time("t1", "s1", 1),
            stop_time("t1", "s2", 2),
            stop_time("t2", "s2", 1),
            stop_time("t2", "s3", 2),
        ],
        shapes: vec![shape_point("sh1", 1), shape_point("sh1", 2)],
        calendar: vec![Calendar::every_day(
            "weekdays",
            date(2024, 1, 1),
            date(2024, 12, 31),
        )],
        calendar_dates: vec![
            calendar_date("weekdays", date(2024, 7, 4), Exception::Deleted),
            calendar_date("holidays", date(2024, 12, 25), Exception::Added),
        ],
        fare_attributes: vec![fare("fare"), fare("zone_fare")],
        fare_rules: vec![
            fare_rule("fare", Some("r1")),
            FareRule {
                origin_id: Some("z1".to_owned()),
                ..fare_rule("zone_fare", None)
            },
        ],
    }
}
