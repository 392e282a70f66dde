use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::{EntityType, Error, Feed};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

/// Files without which a feed is rejected
const MANDATORY: [EntityType; 4] = [
    EntityType::Route,
    EntityType::Trip,
    EntityType::Stop,
    EntityType::StopTime,
];

/// A [Feed] read from disk, with where it came from
#[derive(Debug)]
pub struct ReadFeed {
    /// The rows
    pub feed: Feed,
    /// Files present in the directory or the archive
    pub files: Vec<String>,
    /// sha256 sum of the archive, None for a directory
    pub sha256: Option<String>,
}

/// Allows to parameterize how the parsing library behaves
///
/// ```no_run
/// let read = gtfs_structures::GtfsReader::default()
///     .trim_fields(false)
///     .read_from_path("fixtures/gtfs.zip")?;
/// println!("{} routes", read.feed.routes.len());
/// # Ok::<(), gtfs_structures::Error>(())
/// ```
#[derive(Derivative)]
#[derivative(Default)]
pub struct GtfsReader {
    /// Trim the fields
    ///
    /// It is quite time consumming
    /// If performance is an issue, and if your data is high quality, you can switch it off
    #[derivative(Default(value = "true"))]
    pub trim_fields: bool,
}

impl GtfsReader {
    /// Should the fields be trimmed (default: true)
    pub fn trim_fields(mut self, trim_fields: bool) -> Self {
        self.trim_fields = trim_fields;
        self
    }

    /// Reads a feed from a local zip archive or local directory
    pub fn read_from_path<P>(&self, path: P) -> Result<ReadFeed, Error>
    where
        P: AsRef<Path>,
    {
        let p = path.as_ref();
        if p.is_file() {
            let reader = File::open(p)?;
            self.read_from_reader(reader)
        } else if p.is_dir() {
            self.read_from_directory(p)
        } else {
            Err(Error::NotFileNorDirectory(format!("{}", p.display())))
        }
    }

    fn read_from_directory(&self, p: &Path) -> Result<ReadFeed, Error> {
        let files = std::fs::read_dir(p)?
            .filter_map(|d| {
                d.ok()
                    .and_then(|e| e.file_name().to_str().map(|s| s.to_owned()))
            })
            .collect();

        let table = |entity_type: EntityType| -> Option<Result<File, Error>> {
            let path = p.join(entity_type.file_name());
            if path.exists() {
                Some(File::open(path).map_err(|e| Error::NamedFileIO {
                    file_name: entity_type.file_name().to_owned(),
                    source: Box::new(e),
                }))
            } else {
                None
            }
        };

        let feed = self.read_tables(|entity_type| table(entity_type).transpose())?;

        Ok(ReadFeed {
            feed,
            files,
            sha256: None,
        })
    }

    /// Reads a feed from a zip archive
    ///
    /// The GTFS files may be stored in a subdirectory of the archive
    pub fn read_from_reader<T: Read + Seek>(&self, reader: T) -> Result<ReadFeed, Error> {
        let mut hasher = Sha256::new();
        let mut buf_reader = std::io::BufReader::new(reader);
        std::io::copy(&mut buf_reader, &mut hasher)?;
        let hash = hasher.finalize();
        buf_reader.rewind()?;
        let mut archive = zip::ZipArchive::new(buf_reader)?;

        let mut file_mapping = HashMap::new();
        let mut files = Vec::new();
        for i in 0..archive.len() {
            let archive_file = archive.by_index(i)?;
            let name = archive_file.name().to_owned();
            let path = Path::new(&name);
            let in_macos_resources = path
                .components()
                .any(|c| c.as_os_str() == std::ffi::OsStr::new("__MACOSX"));
            if !in_macos_resources {
                for entity_type in EntityType::ALL {
                    if path.file_name() == Some(std::ffi::OsStr::new(entity_type.file_name())) {
                        file_mapping.insert(entity_type, i);
                    }
                }
            }
            files.push(name);
        }

        let feed = self.read_tables(|entity_type| match file_mapping.get(&entity_type) {
            None => Ok(None),
            Some(i) => {
                let mut content = Vec::new();
                archive
                    .by_index(*i)
                    .and_then(|mut f| f.read_to_end(&mut content).map_err(Into::into))
                    .map_err(|e| Error::NamedFileIO {
                        file_name: entity_type.file_name().to_owned(),
                        source: Box::new(e),
                    })?;
                Ok(Some(std::io::Cursor::new(content)))
            }
        })?;

        Ok(ReadFeed {
            feed,
            files,
            sha256: Some(format!("{:x}", hash)),
        })
    }

    fn read_tables<R, F>(&self, mut open: F) -> Result<Feed, Error>
    where
        R: Read,
        F: FnMut(EntityType) -> Result<Option<R>, Error>,
    {
        let mut table = |entity_type: EntityType| -> Result<Option<R>, Error> {
            let reader = open(entity_type)?;
            if reader.is_none() && MANDATORY.contains(&entity_type) {
                return Err(Error::MissingFile(entity_type.file_name().to_owned()));
            }
            Ok(reader)
        };

        let mut feed = Feed::default();
        feed.routes = self.read_optional(table(EntityType::Route)?, EntityType::Route)?;
        feed.trips = self.read_optional(table(EntityType::Trip)?, EntityType::Trip)?;
        feed.stops = self.read_optional(table(EntityType::Stop)?, EntityType::Stop)?;
        feed.stop_times = self.read_optional(table(EntityType::StopTime)?, EntityType::StopTime)?;
        feed.shapes = self.read_optional(table(EntityType::Shape)?, EntityType::Shape)?;
        feed.calendar = self.read_optional(table(EntityType::Calendar)?, EntityType::Calendar)?;
        feed.calendar_dates =
            self.read_optional(table(EntityType::CalendarDate)?, EntityType::CalendarDate)?;
        feed.fare_attributes =
            self.read_optional(table(EntityType::FareAttribute)?, EntityType::FareAttribute)?;
        feed.fare_rules = self.read_optional(table(EntityType::FareRule)?, EntityType::FareRule)?;
        Ok(feed)
    }

    fn read_optional<T, O>(&self, reader: Option<T>, entity_type: EntityType) -> Result<Vec<O>, Error>
    where
        for<'de> O: Deserialize<'de>,
        T: Read,
    {
        match reader {
            None => Ok(Vec::new()),
            Some(r) => self.read_objs(r, entity_type.file_name()),
        }
    }

    /// Reads every line of a CSV file, skipping a leading UTF-8 byte order mark
    pub fn read_objs<T, O>(&self, mut reader: T, file_name: &str) -> Result<Vec<O>, Error>
    where
        for<'de> O: Deserialize<'de>,
        T: Read,
    {
        let mut content = Vec::new();
        reader
            .read_to_end(&mut content)
            .map_err(|e| Error::NamedFileIO {
                file_name: file_name.to_owned(),
                source: Box::new(e),
            })?;
        let content = content
            .strip_prefix(&[0xefu8, 0xbbu8, 0xbfu8])
            .unwrap_or(&content);

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(if self.trim_fields {
                csv::Trim::Fields
            } else {
                csv::Trim::None
            })
            .from_reader(content);
        // We store the headers to be able to return them in case of errors
        let headers = reader
            .headers()
            .map_err(|e| Error::CSVError {
                file_name: file_name.to_owned(),
                source: e,
                line_in_error: None,
            })?
            .clone();

        let mut rec = csv::StringRecord::new();
        let mut objs = Vec::new();

        while reader.read_record(&mut rec).map_err(|e| Error::CSVError {
            file_name: file_name.to_owned(),
            source: e,
            line_in_error: None,
        })? {
            let obj = rec
                .deserialize(Some(&headers))
                .map_err(|e| Error::CSVError {
                    file_name: file_name.to_owned(),
                    source: e,
                    line_in_error: Some(crate::error::LineError {
                        headers: headers.into_iter().map(String::from).collect(),
                        values: rec.into_iter().map(String::from).collect(),
                    }),
                })?;
            objs.push(obj);
        }
        Ok(objs)
    }
}
