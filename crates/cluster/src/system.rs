//! Host facts needed to place cluster nodes: identity and free ports.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::node::NodeClient;
use crate::Error;

/// File holding the machine id generated at install time.
pub const MACHINE_ID_FILE: &str = "/etc/openvstorage_id";

/// Kernel setting with the ephemeral port range.
pub const EPHEMERAL_PORT_RANGE_FILE: &str = "/proc/sys/net/ipv4/ip_local_port_range";

const LISTENING_PORTS: &str =
    "netstat -ln | sed 1,2d | sed 's/\\s\\s*/ /g' | cut -d ' ' -f 4 | cut -d ':' -f 2";

/// Ports at or below this value are never handed out.
const PRIVILEGED_PORTS: u32 = 1024;

/// A port range to allocate from.
///
/// Serialized the way host settings store it: `[26400, 26499]` for a closed
/// range, `26400` for everything from a port up to 65535.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortRange {
    /// From the port up to 65535.
    From(u16),
    /// Both ends included.
    Between(u16, u16),
}

impl PortRange {
    fn ports(self) -> RangeInclusive<u32> {
        let (start, end) = match self {
            Self::From(start) => (u32::from(start), u32::from(u16::MAX)),
            Self::Between(start, end) => (u32::from(start), u32::from(end)),
        };
        start.max(PRIVILEGED_PORTS + 1)..=end
    }
}

/// Unique id of the host, used as node name.
///
/// # Errors
///
/// Fails if the id file cannot be read or is empty.
pub async fn machine_id(client: &dyn NodeClient) -> Result<String, Error> {
    let id = client.file_read(MACHINE_ID_FILE).await?.trim().to_string();
    if id.is_empty() {
        return Err(Error::UnexpectedOutput {
            ip: client.ip().to_string(),
            detail: format!("{MACHINE_ID_FILE} is empty"),
        });
    }
    Ok(id)
}

/// Ports something is listening on.
///
/// # Errors
///
/// Fails if `netstat` cannot be run.
pub async fn ports_in_use(client: &dyn NodeClient) -> Result<Vec<u16>, Error> {
    Ok(client
        .run_shell(LISTENING_PORTS)
        .await?
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect())
}

/// The range the kernel picks outgoing ports from, end excluded.
///
/// # Errors
///
/// Fails if the setting cannot be read or parsed.
pub async fn ephemeral_port_range(client: &dyn NodeClient) -> Result<std::ops::Range<u32>, Error> {
    let contents = client.file_read(EPHEMERAL_PORT_RANGE_FILE).await?;
    let bounds: Vec<u32> = contents
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .map_err(|error| Error::UnexpectedOutput {
            ip: client.ip().to_string(),
            detail: format!("{EPHEMERAL_PORT_RANGE_FILE}: {error}"),
        })?;

    match (bounds.iter().min(), bounds.iter().max()) {
        (Some(&low), Some(&high)) => Ok(low..high),
        _ => Err(Error::UnexpectedOutput {
            ip: client.ip().to_string(),
            detail: format!("{EPHEMERAL_PORT_RANGE_FILE} is empty"),
        }),
    }
}

/// Picks the first `count` ports of `ranges`, in order, that are not
/// excluded, not in use and outside the ephemeral range.
///
/// # Errors
///
/// Fails with [`Error::NoFreePorts`] when the ranges hold fewer candidates.
pub fn select_free_ports(
    ranges: &[PortRange],
    exclude: &[u16],
    in_use: &[u16],
    ephemeral: &std::ops::Range<u32>,
    count: usize,
) -> Result<Vec<u16>, Error> {
    let mut found = Vec::with_capacity(count);
    if count == 0 {
        return Ok(found);
    }

    for port in ranges.iter().flat_map(|range| range.ports()) {
        let Ok(port) = u16::try_from(port) else {
            break;
        };
        if ephemeral.contains(&u32::from(port)) || exclude.contains(&port) || in_use.contains(&port) {
            continue;
        }
        found.push(port);
        if found.len() == count {
            return Ok(found);
        }
    }

    Err(Error::NoFreePorts {
        requested: count,
        found,
    })
}

/// [`select_free_ports`] with the ports in use and the ephemeral range of the host.
///
/// # Errors
///
/// Fails if the host cannot be inspected or not enough ports are free.
pub async fn get_free_ports(
    client: &dyn NodeClient,
    ranges: &[PortRange],
    exclude: &[u16],
    count: usize,
) -> Result<Vec<u16>, Error> {
    let in_use = ports_in_use(client).await?;
    let ephemeral = ephemeral_port_range(client).await?;
    let ports = select_free_ports(ranges, exclude, &in_use, &ephemeral, count)?;
    debug!(ip = %client.ip(), ports = ?ports, "selected free ports");
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const NO_EPHEMERAL: std::ops::Range<u32> = 0..0;

    #[test]
    fn test_port_range_encoding() {
        let ranges: Vec<PortRange> = serde_json::from_str("[26400, [26500, 26599]]").unwrap();

        assert_eq!(ranges, vec![PortRange::From(26400), PortRange::Between(26500, 26599)]);
        assert_eq!(serde_json::to_string(&ranges).unwrap(), "[26400,[26500,26599]]");
    }

    #[test]
    fn test_select_in_order_skipping_taken_ports() {
        let ports = select_free_ports(
            &[PortRange::Between(26400, 26410)],
            &[26400],
            &[26401, 26403],
            &NO_EPHEMERAL,
            2,
        )
        .unwrap();

        assert_eq!(ports, vec![26402, 26404]);
    }

    #[test]
    fn test_select_skips_ephemeral_and_privileged_ports() {
        let ephemeral = 32768..60999;

        assert_eq!(
            select_free_ports(&[PortRange::From(32760)], &[], &[], &ephemeral, 10).unwrap(),
            vec![32760, 32761, 32762, 32763, 32764, 32765, 32766, 32767, 60999, 61000]
        );
        assert_eq!(
            select_free_ports(&[PortRange::Between(1000, 1030)], &[], &[], &NO_EPHEMERAL, 1).unwrap(),
            vec![1025]
        );
    }

    #[test]
    fn test_select_runs_out() {
        assert_matches!(
            select_free_ports(&[PortRange::Between(65534, 65535)], &[65535], &[], &NO_EPHEMERAL, 2),
            Err(Error::NoFreePorts { requested: 2, found }) if found == vec![65534]
        );
        assert_matches!(
            select_free_ports(&[PortRange::From(65535)], &[], &[], &NO_EPHEMERAL, 2),
            Err(Error::NoFreePorts { .. })
        );
    }
}
