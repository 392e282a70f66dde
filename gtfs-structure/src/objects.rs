pub use crate::enums::*;
use crate::serde_helpers::*;
use chrono::NaiveDate;

use std::fmt;

/// A route is a commercial line. See <https://gtfs.org/reference/static/#routestxt>
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Route {
    /// Unique technical (not for the traveller) identifier for the route
    #[serde(rename = "route_id")]
    pub id: String,
    /// GTFS agency operating the route, left empty in produced feeds
    #[serde(default)]
    pub agency_id: Option<String>,
    /// Short name of a route, like "32", "100X" or "Green"
    #[serde(rename = "route_short_name", default)]
    pub short_name: String,
    /// Full name of a route
    #[serde(rename = "route_long_name", default)]
    pub long_name: String,
    /// Description of a route
    #[serde(rename = "route_desc", default)]
    pub desc: Option<String>,
    /// Indicates the type of transportation used on a route
    #[serde(default)]
    pub route_type: RouteType,
    /// URL of a web page about the particular route
    #[serde(rename = "route_url", default)]
    pub url: Option<String>,
    /// Route color, RRGGBB without a leading `#`
    #[serde(rename = "route_color", default)]
    pub color: Option<String>,
    /// Legible color to use for text drawn against [Route::color]
    #[serde(rename = "route_text_color", default)]
    pub text_color: Option<String>,
    /// Orders the routes for presentation to customers
    #[serde(rename = "route_sort_order", default)]
    pub order: Option<u32>,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !self.long_name.is_empty() {
            write!(f, "{}", self.long_name)
        } else {
            write!(f, "{}", self.short_name)
        }
    }
}

/// A Trip is a vehicle that follows a sequence of [StopTime] on certain days. See <https://gtfs.org/reference/static/#tripstxt>
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Trip {
    /// [Route] along which this trip runs
    pub route_id: String,
    /// [Calendar] (or [CalendarDate] service) on which this trip runs
    pub service_id: String,
    /// Unique technical (not for the traveller) identifier for the Trip
    #[serde(rename = "trip_id")]
    pub id: String,
    /// Text that appears on signage identifying the trip's destination to riders
    #[serde(default)]
    pub trip_headsign: Option<String>,
    /// Public facing text used to identify the trip to riders
    #[serde(default)]
    pub trip_short_name: Option<String>,
    /// Direction of travel, for display only
    #[serde(default)]
    pub direction_id: Option<DirectionType>,
    /// Block to which the trip belongs
    #[serde(default)]
    pub block_id: Option<String>,
    /// Geographical [ShapePoint]s followed by the vehicle
    #[serde(default)]
    pub shape_id: Option<String>,
}

impl fmt::Display for Trip {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "route id: {}, service id: {}",
            self.route_id, self.service_id
        )
    }
}

/// A physical stop, station or area. See <https://gtfs.org/reference/static/#stopstxt>
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Stop {
    /// Unique technical identifier (not for the traveller) of the stop
    #[serde(rename = "stop_id")]
    pub id: String,
    /// Short text or a number that identifies the location for riders
    #[serde(rename = "stop_code", default)]
    pub code: Option<String>,
    /// Name of the location
    #[serde(rename = "stop_name", default)]
    pub name: String,
    /// Description of the location
    #[serde(rename = "stop_desc", default)]
    pub description: Option<String>,
    /// Latitude of the stop
    #[serde(
        rename = "stop_lat",
        default,
        deserialize_with = "de_with_optional_float",
        serialize_with = "serialize_float_as_str"
    )]
    pub latitude: Option<f64>,
    /// Longitude of the stop
    #[serde(
        rename = "stop_lon",
        default,
        deserialize_with = "de_with_optional_float",
        serialize_with = "serialize_float_as_str"
    )]
    pub longitude: Option<f64>,
    /// Fare zone of the stop
    #[serde(default)]
    pub zone_id: Option<String>,
    /// Type of the location
    #[serde(default)]
    pub location_type: LocationType,
    /// Station containing this stop. It is another [Stop] of the same feed
    #[serde(default)]
    pub parent_station: Option<String>,
    /// Platform identifier for a platform stop
    #[serde(default)]
    pub platform_code: Option<String>,
}

impl fmt::Display for Stop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// The moment where a vehicle, running on [Trip] stops at a [Stop]. See <https://gtfs.org/reference/static/#stop_timestxt>
///
/// A stop time is identified by its `trip_id` and `stop_sequence`.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct StopTime {
    /// [Trip] to which this stop time belongs to
    pub trip_id: String,
    /// Arrival time, in seconds after midnight. Intermediate stops may have none
    #[serde(
        default,
        deserialize_with = "deserialize_optional_time",
        serialize_with = "serialize_optional_time"
    )]
    pub arrival_time: Option<u32>,
    /// Departure time, in seconds after midnight. Intermediate stops may have none
    #[serde(
        default,
        deserialize_with = "deserialize_optional_time",
        serialize_with = "serialize_optional_time"
    )]
    pub departure_time: Option<u32>,
    /// Identifier of the [Stop] where the vehicle stops
    pub stop_id: String,
    /// Order of stops for a particular trip
    pub stop_sequence: u32,
    /// Text that appears on signage identifying the trip's destination to riders
    #[serde(default)]
    pub stop_headsign: Option<String>,
    /// Pickup method, GTFS integer value
    #[serde(default)]
    pub pickup_type: Option<u8>,
    /// Drop off method, GTFS integer value
    #[serde(default)]
    pub drop_off_type: Option<u8>,
    /// Distance traveled along the shape from the first stop
    #[serde(default)]
    pub shape_dist_traveled: Option<f32>,
    /// Are times exact (1) or approximate (0)
    #[serde(default)]
    pub timepoint: Option<u8>,
}

/// A single geographical point of a shape. See <https://gtfs.org/reference/static/#shapestxt>
///
/// All the points sharing a `shape_id` form one shape.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct ShapePoint {
    /// Identifier of the shape this point belongs to
    #[serde(rename = "shape_id")]
    pub id: String,
    /// Latitude of a shape point
    #[serde(rename = "shape_pt_lat", default)]
    pub latitude: f64,
    /// Longitude of a shape point
    #[serde(rename = "shape_pt_lon", default)]
    pub longitude: f64,
    /// Sequence in which the shape points connect to form the shape
    #[serde(rename = "shape_pt_sequence")]
    pub sequence: u32,
    /// Distance traveled along the shape from the first shape point
    #[serde(rename = "shape_dist_traveled", default)]
    pub dist_traveled: Option<f32>,
}

/// A calender describes on which days the vehicle runs. See <https://gtfs.org/reference/static/#calendartxt>
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Calendar {
    /// Unique technical identifier (not for the traveller) of this calendar
    #[serde(rename = "service_id")]
    pub id: String,
    /// Does the service run on mondays
    #[serde(deserialize_with = "deserialize_bool", serialize_with = "serialize_bool")]
    pub monday: bool,
    /// Does the service run on tuesdays
    #[serde(deserialize_with = "deserialize_bool", serialize_with = "serialize_bool")]
    pub tuesday: bool,
    /// Does the service run on wednesdays
    #[serde(deserialize_with = "deserialize_bool", serialize_with = "serialize_bool")]
    pub wednesday: bool,
    /// Does the service run on thursdays
    #[serde(deserialize_with = "deserialize_bool", serialize_with = "serialize_bool")]
    pub thursday: bool,
    /// Does the service run on fridays
    #[serde(deserialize_with = "deserialize_bool", serialize_with = "serialize_bool")]
    pub friday: bool,
    /// Does the service run on saturdays
    #[serde(deserialize_with = "deserialize_bool", serialize_with = "serialize_bool")]
    pub saturday: bool,
    /// Does the service run on sundays
    #[serde(deserialize_with = "deserialize_bool", serialize_with = "serialize_bool")]
    pub sunday: bool,
    /// Start service day for the service interval
    #[serde(deserialize_with = "deserialize_date", serialize_with = "serialize_date")]
    pub start_date: NaiveDate,
    /// End service day for the service interval. This service day is included in the interval
    #[serde(deserialize_with = "deserialize_date", serialize_with = "serialize_date")]
    pub end_date: NaiveDate,
}

impl fmt::Display for Calendar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}..{}", self.start_date, self.end_date)
    }
}

impl Calendar {
    /// A calendar running every day between `start_date` and `end_date`
    pub fn every_day(id: &str, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            id: id.to_owned(),
            monday: true,
            tuesday: true,
            wednesday: true,
            thursday: true,
            friday: true,
            saturday: true,
            sunday: true,
            start_date,
            end_date,
        }
    }
}

/// Defines a specific date that can be added or removed from a [Calendar]. See <https://gtfs.org/reference/static/#calendar_datestxt>
///
/// The `service_id` does not need a matching [Calendar]: a service can be defined by its
/// exceptions only.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CalendarDate {
    /// Identifier of the service that is modified at this date
    pub service_id: String,
    /// Date where the service will be added or deleted
    #[serde(deserialize_with = "deserialize_date", serialize_with = "serialize_date")]
    pub date: NaiveDate,
    /// Is the service added or deleted
    pub exception_type: Exception,
}

/// Defines one possible fare. See <https://gtfs.org/reference/static/#fare_attributestxt>
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FareAttribute {
    /// Unique technical (not for the traveller) identifier for the FareAttribute
    #[serde(rename = "fare_id")]
    pub id: String,
    /// Fare price, in the unit specified by [FareAttribute::currency]
    pub price: String,
    /// Currency used to pay the fare.
    #[serde(rename = "currency_type")]
    pub currency: String,
    /// Indicates when the fare must be paid
    pub payment_method: PaymentMethod,
    /// Number of transfers permitted on this fare, unlimited when empty
    #[serde(default)]
    pub transfers: Option<u8>,
    /// Identifies the relevant agency for a fare, left empty in produced feeds
    #[serde(default)]
    pub agency_id: Option<String>,
    /// Length of time in seconds before a transfer expires
    #[serde(default)]
    pub transfer_duration: Option<u32>,
}

/// Applies a [FareAttribute] to a route or to zones. See <https://gtfs.org/reference/static/#fare_rulestxt>
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct FareRule {
    /// The [FareAttribute] this rule applies
    pub fare_id: String,
    /// [Route] on which the fare applies, every route when empty
    #[serde(default)]
    pub route_id: Option<String>,
    /// Origin fare zone
    #[serde(default)]
    pub origin_id: Option<String>,
    /// Destination fare zone
    #[serde(default)]
    pub destination_id: Option<String>,
    /// Zone the itinerary passes through
    #[serde(default)]
    pub contains_id: Option<String>,
}

