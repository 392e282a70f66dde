use serde::Serialize;

use crate::{EntityType, Error, Feed};
use std::fs::File;
use std::path::Path;

/// Header written for a mandatory file that holds no row, None for optional files
fn empty_headers(entity_type: EntityType) -> Option<&'static [&'static str]> {
    match entity_type {
        EntityType::Route => Some(&[
            "route_id",
            "route_short_name",
            "route_long_name",
            "route_type",
        ]),
        EntityType::Trip => Some(&["route_id", "service_id", "trip_id"]),
        EntityType::Stop => Some(&["stop_id", "stop_name", "stop_lat", "stop_lon"]),
        EntityType::StopTime => Some(&[
            "trip_id",
            "arrival_time",
            "departure_time",
            "stop_id",
            "stop_sequence",
        ]),
        _ => None,
    }
}

/// Writes a [Feed] as a directory of GTFS files
///
/// Empty optional tables are not written. The mandatory ones always are, with their headers
/// only when they hold no row, so that the directory can be read back.
#[derive(Debug, Default)]
pub struct GtfsWriter {}

impl GtfsWriter {
    /// Writes every table of `feed` into `dir`, creating it if needed
    pub fn write_to_directory<P: AsRef<Path>>(&self, feed: &Feed, dir: P) -> Result<(), Error> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.write_objs(dir, EntityType::Route, &feed.routes)?;
        self.write_objs(dir, EntityType::Trip, &feed.trips)?;
        self.write_objs(dir, EntityType::Stop, &feed.stops)?;
        self.write_objs(dir, EntityType::StopTime, &feed.stop_times)?;
        self.write_objs(dir, EntityType::Shape, &feed.shapes)?;
        self.write_objs(dir, EntityType::Calendar, &feed.calendar)?;
        self.write_objs(dir, EntityType::CalendarDate, &feed.calendar_dates)?;
        self.write_objs(dir, EntityType::FareAttribute, &feed.fare_attributes)?;
        self.write_objs(dir, EntityType::FareRule, &feed.fare_rules)?;
        Ok(())
    }

    fn write_objs<O: Serialize>(
        &self,
        dir: &Path,
        entity_type: EntityType,
        objs: &[O],
    ) -> Result<(), Error> {
        let headers = empty_headers(entity_type);
        if objs.is_empty() && headers.is_none() {
            return Ok(());
        }
        let file_name = entity_type.file_name();
        let file = File::create(dir.join(file_name)).map_err(|e| Error::NamedFileIO {
            file_name: file_name.to_owned(),
            source: Box::new(e),
        })?;
        let to_error = |source| Error::CSVWrite {
            file_name: file_name.to_owned(),
            source,
        };

        let mut writer = csv::Writer::from_writer(file);
        match headers {
            Some(headers) if objs.is_empty() => writer.write_record(headers).map_err(to_error)?,
            _ => {
                for obj in objs {
                    writer.serialize(obj).map_err(to_error)?;
                }
            }
        }
        writer
            .flush()
            .map_err(|e| to_error(csv::Error::from(e)))?;
        Ok(())
    }
}
