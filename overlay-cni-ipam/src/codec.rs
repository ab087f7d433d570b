//! Value encodings of the ipam keys. Lists are `;` separated, the host map is
//! a json object of block to node name.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::{Error, Result};

const SEPARATOR: &str = ";";

/// {block network address: node name}
pub type HostSubnetMap = BTreeMap<String, String>;

pub fn encode_addrs<'a>(addrs: impl IntoIterator<Item = &'a Ipv4Addr>) -> String {
    addrs
        .into_iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(SEPARATOR)
}

pub fn decode_addrs(key: &str, value: &str) -> Result<Vec<Ipv4Addr>> {
    value
        .split(SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Ipv4Addr>().map_err(|e| Error::Corrupt {
                key: key.to_owned(),
                reason: format!("{s}: {e}"),
            })
        })
        .collect()
}

pub fn decode_record(key: &str, value: &str) -> Result<BTreeSet<Ipv4Addr>> {
    Ok(decode_addrs(key, value)?.into_iter().collect())
}

pub fn encode_blocks(blocks: &[Ipv4Network]) -> String {
    encode_addrs(blocks.iter().map(|b| b.network()).collect::<Vec<_>>().iter())
}

pub fn decode_blocks(key: &str, value: &str, prefix: u8) -> Result<Vec<Ipv4Network>> {
    decode_addrs(key, value)?
        .into_iter()
        .map(|addr| decode_block_addr(key, addr, prefix))
        .collect()
}

pub fn decode_block(key: &str, value: &str, prefix: u8) -> Result<Ipv4Network> {
    let addr = value.trim().parse::<Ipv4Addr>().map_err(|e| Error::Corrupt {
        key: key.to_owned(),
        reason: format!("{value}: {e}"),
    })?;
    decode_block_addr(key, addr, prefix)
}

fn decode_block_addr(key: &str, addr: Ipv4Addr, prefix: u8) -> Result<Ipv4Network> {
    let block = Ipv4Network::new(addr, prefix)?;
    if block.network() != addr {
        return Err(Error::Corrupt {
            key: key.to_owned(),
            reason: format!("{addr} is not a /{prefix} network address"),
        });
    }
    Ok(block)
}

pub fn encode_host_map(map: &HostSubnetMap) -> Result<String> {
    Ok(serde_json::to_string(map)?)
}

pub fn decode_host_map(key: &str, value: &str) -> Result<HostSubnetMap> {
    if value.trim().is_empty() {
        return Ok(HostSubnetMap::new());
    }
    serde_json::from_str(value).map_err(|e| Error::Corrupt {
        key: key.to_owned(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_decode_record_drops_duplicates_and_blanks() -> Result<()> {
        let record = decode_record("k", "10.244.7.3;;10.244.7.2;10.244.7.3;")?;
        assert_eq!(
            record.into_iter().collect::<Vec<_>>(),
            vec![Ipv4Addr::new(10, 244, 7, 2), Ipv4Addr::new(10, 244, 7, 3)]
        );
        Ok(())
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_addrs("k", "10.244.7.2;nope").unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }));
    }

    #[test]
    fn test_blocks_must_be_network_addresses() {
        assert!(decode_blocks("k", "10.244.1.0;10.244.2.0", 24).is_ok());
        assert!(decode_block("k", "10.244.1.9", 24).is_err());
    }

    #[test]
    fn test_host_map_empty_value() -> Result<()> {
        assert!(decode_host_map("k", "")?.is_empty());
        let mut map = HostSubnetMap::new();
        map.insert("10.244.7.0".into(), "node-a".into());
        let encoded = encode_host_map(&map)?;
        assert_eq!(encoded, r#"{"10.244.7.0":"node-a"}"#);
        Ok(())
    }
}
