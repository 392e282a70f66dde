use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// The GTFS entity types that take part in a merge or a split
///
/// Keyed types own an identifier namespace inside a feed. The others are identified by a
/// composite key made of their parents' identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// [Route] <https://gtfs.org/reference/static/#routestxt>
    Route,
    /// [Trip] <https://gtfs.org/reference/static/#tripstxt>
    Trip,
    /// [Stop] <https://gtfs.org/reference/static/#stopstxt>
    Stop,
    /// [StopTime] <https://gtfs.org/reference/static/#stop_timestxt>
    StopTime,
    /// [ShapePoint] grouped by `shape_id` <https://gtfs.org/reference/static/#shapestxt>
    Shape,
    /// [Calendar] <https://gtfs.org/reference/static/#calendartxt>
    Calendar,
    /// [CalendarDate] <https://gtfs.org/reference/static/#calendar_datestxt>
    CalendarDate,
    /// [FareAttribute] <https://gtfs.org/reference/static/#fare_attributestxt>
    FareAttribute,
    /// [FareRule] <https://gtfs.org/reference/static/#fare_rulestxt>
    FareRule,
}

impl EntityType {
    /// Every entity type, in declaration order
    pub const ALL: [EntityType; 9] = [
        EntityType::Route,
        EntityType::Trip,
        EntityType::Stop,
        EntityType::StopTime,
        EntityType::Shape,
        EntityType::Calendar,
        EntityType::CalendarDate,
        EntityType::FareAttribute,
        EntityType::FareRule,
    ];

    /// Does this type own a feed-scoped identifier namespace
    ///
    /// [EntityType::StopTime], [EntityType::CalendarDate] and [EntityType::FareRule] are
    /// identified by the keys of the entities they reference.
    pub fn is_keyed(self) -> bool {
        !matches!(
            self,
            EntityType::StopTime | EntityType::CalendarDate | EntityType::FareRule
        )
    }

    /// Name of the GTFS file holding this type
    pub fn file_name(self) -> &'static str {
        match self {
            EntityType::Route => "routes.txt",
            EntityType::Trip => "trips.txt",
            EntityType::Stop => "stops.txt",
            EntityType::StopTime => "stop_times.txt",
            EntityType::Shape => "shapes.txt",
            EntityType::Calendar => "calendar.txt",
            EntityType::CalendarDate => "calendar_dates.txt",
            EntityType::FareAttribute => "fare_attributes.txt",
            EntityType::FareRule => "fare_rules.txt",
        }
    }

    /// The snake_case name used in requests and reports
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Route => "route",
            EntityType::Trip => "trip",
            EntityType::Stop => "stop",
            EntityType::StopTime => "stop_time",
            EntityType::Shape => "shape",
            EntityType::Calendar => "calendar",
            EntityType::CalendarDate => "calendar_date",
            EntityType::FareAttribute => "fare_attribute",
            EntityType::FareRule => "fare_rule",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("{s} is not an entity type"))
    }
}

/// Describes the kind of [Stop]. See <https://gtfs.org/reference/static/#stopstxt> `location_type`
#[derive(Derivative, Debug, Copy, Clone, PartialEq, Eq)]
#[derivative(Default(bound = ""))]
pub enum LocationType {
    /// A location where passengers board or disembark from a transit vehicle
    #[derivative(Default)]
    StopPoint,
    /// Station. A physical structure or area that contains one or more platform
    StopArea,
    /// A location where passengers can enter or exit a station from the street
    StationEntrance,
    /// A location within a station used to link pathways together
    GenericNode,
    /// A specific location on a platform, where passengers can board and/or alight vehicles
    BoardingArea,
    /// An unknown value
    Unknown(i32),
}

fn serialize_i32_as_str<S: Serializer>(s: S, value: i32) -> Result<S::Ok, S::Error> {
    s.serialize_str(&value.to_string())
}

impl<'de> Deserialize<'de> for LocationType {
    fn deserialize<D>(deserializer: D) -> Result<LocationType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "" | "0" => LocationType::StopPoint,
            "1" => LocationType::StopArea,
            "2" => LocationType::StationEntrance,
            "3" => LocationType::GenericNode,
            "4" => LocationType::BoardingArea,
            s => LocationType::Unknown(s.parse().map_err(|_| {
                serde::de::Error::custom(format!(
                    "invalid value for LocationType, must be an integer: {}",
                    s
                ))
            })?),
        })
    }
}

impl Serialize for LocationType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize_i32_as_str(
            serializer,
            match self {
                LocationType::StopPoint => 0,
                LocationType::StopArea => 1,
                LocationType::StationEntrance => 2,
                LocationType::GenericNode => 3,
                LocationType::BoardingArea => 4,
                LocationType::Unknown(i) => *i,
            },
        )
    }
}

/// Describes the kind of [Route]. See <https://gtfs.org/reference/static/#routestxt> `route_type`
///
/// Extended route types are kept verbatim in [RouteType::Other] so that a merged feed writes
/// back exactly what the sources contained.
#[derive(Debug, Derivative, Copy, Clone, PartialEq, Eq, Hash)]
#[derivative(Default(bound = ""))]
pub enum RouteType {
    /// Tram, Streetcar, Light rail
    Tramway,
    /// Subway, Metro
    Subway,
    /// Intercity or long-distance rail
    Rail,
    /// Short- and long-distance bus routes
    #[derivative(Default)]
    Bus,
    /// Boat service
    Ferry,
    /// Street-level rail cars where the cable runs beneath the vehicle
    CableCar,
    /// Aerial lift, suspended cable car
    Gondola,
    /// Rail system designed for steep inclines
    Funicular,
    /// Any other value, including extended route types
    Other(i32),
}

impl<'de> Deserialize<'de> for RouteType {
    fn deserialize<D>(deserializer: D) -> Result<RouteType, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match i32::deserialize(deserializer)? {
            0 => RouteType::Tramway,
            1 => RouteType::Subway,
            2 => RouteType::Rail,
            3 => RouteType::Bus,
            4 => RouteType::Ferry,
            5 => RouteType::CableCar,
            6 => RouteType::Gondola,
            7 => RouteType::Funicular,
            i => RouteType::Other(i),
        })
    }
}

impl Serialize for RouteType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i32(match self {
            RouteType::Tramway => 0,
            RouteType::Subway => 1,
            RouteType::Rail => 2,
            RouteType::Bus => 3,
            RouteType::Ferry => 4,
            RouteType::CableCar => 5,
            RouteType::Gondola => 6,
            RouteType::Funicular => 7,
            RouteType::Other(i) => *i,
        })
    }
}

/// Defines if a [CalendarDate] is added or deleted from a [Calendar]
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Exception {
    /// There will be a service on that day
    #[serde(rename = "1")]
    Added,
    /// There won’t be a service on that day
    #[serde(rename = "2")]
    Deleted,
}

/// Defines the direction of a [Trip], only for display, not for routing
#[derive(Debug, Deserialize, Serialize, Copy, Clone, PartialEq, Eq)]
pub enum DirectionType {
    /// Travel in one direction (e.g. outbound travel).
    #[serde(rename = "0")]
    Outbound,
    /// Travel in the opposite direction (e.g. inbound travel).
    #[serde(rename = "1")]
    Inbound,
}

/// Defines where a [FareAttribute] can be paid
#[derive(Debug, Deserialize, Serialize, Copy, Clone, PartialEq, Eq)]
pub enum PaymentMethod {
    /// Fare is paid on board
    #[serde(rename = "0")]
    Aboard,
    /// Fare must be paid before boarding
    #[serde(rename = "1")]
    PreBoarding,
}
