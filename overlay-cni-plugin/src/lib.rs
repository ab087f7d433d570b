pub mod config;
pub mod context;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod modes;
pub mod netlink;
pub mod response;
pub mod types;
pub mod version;

use std::fmt::Display;
use std::str::FromStr;

use semver::Version;
use serde::{Deserialize, Deserializer, Serializer, de};

pub use error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Version this plugin speaks when the caller gave none it can use.
pub const CNI_VERSION: Version = Version::new(1, 1, 0);

pub const SUPPORTED_CNI_VERSION: [Version; 5] = [
    Version::new(0, 3, 0),
    Version::new(0, 3, 1),
    Version::new(0, 4, 0),
    Version::new(1, 0, 0),
    Version::new(1, 1, 0),
];

pub fn serialize_to_string<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: Display,
    S: Serializer,
{
    serializer.collect_str(value)
}

pub fn deserialize_from_str<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: FromStr,
    T::Err: Display,
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    T::from_str(&s).map_err(de::Error::custom)
}

pub fn serialize_to_string_slice<T, S>(values: &[T], serializer: S) -> Result<S::Ok, S::Error>
where
    T: Display,
    S: Serializer,
{
    serializer.collect_seq(values.iter().map(|v| v.to_string()))
}

pub fn deserialize_from_str_vec<'de, T, D>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    T: FromStr,
    T::Err: Display,
    D: Deserializer<'de>,
{
    Vec::<String>::deserialize(deserializer)?
        .iter()
        .map(|s| T::from_str(s).map_err(de::Error::custom))
        .collect()
}
