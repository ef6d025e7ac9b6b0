//! # Summary
//!
//! Static simulation topology. The site table is loaded once at startup from
//! a plain text file and stays immutable for the process lifetime: one line
//! per site, `<id> <ip:port> <link-speed-bps>`, where id 0 is always the
//! supervisor. Lines starting with `#` and blank lines are skipped.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use crate::error::Error;

/// Numeric site identity. 1..=N are peers; 0 is reserved for the supervisor.
pub type SiteId = u64;

/// The supervisor never competes for the critical region.
pub const SUPERVISOR_ID: SiteId = 0;

/// One participant: identity, endpoint, and informational link capacity.
#[derive(Clone, Debug)]
pub struct Site {
    pub id: SiteId,
    pub addr: SocketAddr,
    /// Outbound link capacity in bits per second. Informational only.
    pub link_speed: u64,
}

impl Site {
    /// Nominal transmission delay of a message over this site's link.
    pub fn delay_usec(&self, len: usize) -> u64 {
        if self.link_speed == 0 {
            return 0;
        }
        len as u64 * 1_000_000 / self.link_speed
    }
}

/// Immutable topology plus the local site identity.
#[derive(Clone, Debug)]
pub struct Config {
    id: SiteId,
    /// Indexed by site id, supervisor included at index 0.
    sites: Vec<Site>,
}

impl Config {
    /// Builds a topology from an explicit site table, indexed by id.
    pub fn from_sites(id: SiteId, sites: Vec<Site>) -> Result<Self, Error> {
        if sites.len() < 2 {
            return Err(Error::Config(
                "topology needs the supervisor and at least one peer".to_string(),
            ));
        }
        for (ix, site) in sites.iter().enumerate() {
            if site.id != ix as SiteId {
                return Err(Error::Config(format!(
                    "site table entry {} carries id {}",
                    ix, site.id
                )));
            }
        }
        if id as usize >= sites.len() {
            return Err(Error::BadSite(id));
        }
        Ok(Config { id, sites })
    }

    /// Loads the topology file and checks that `id` is part of it.
    pub fn load<P: AsRef<Path>>(path: P, id: SiteId) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text, id)
    }

    fn parse(text: &str, id: SiteId) -> Result<Self, Error> {
        let mut sites: Vec<Site> = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let site = match (fields.next(), fields.next(), fields.next()) {
                (Some(id), Some(addr), Some(speed)) => Site {
                    id: id
                        .parse::<SiteId>()
                        .map_err(|_| Self::bad_line(lineno, "site id"))?,
                    addr: addr
                        .parse::<SocketAddr>()
                        .map_err(|_| Self::bad_line(lineno, "endpoint"))?,
                    link_speed: speed
                        .parse::<u64>()
                        .map_err(|_| Self::bad_line(lineno, "link speed"))?,
                },
                _ => return Err(Self::bad_line(lineno, "field count")),
            };
            if site.id as usize != sites.len() {
                return Err(Error::Config(format!(
                    "line {}: site ids must be contiguous from 0",
                    lineno + 1
                )));
            }
            sites.push(site);
        }
        Self::from_sites(id, sites)
    }

    fn bad_line(lineno: usize, what: &str) -> Error {
        Error::Config(format!("line {}: invalid {}", lineno + 1, what))
    }

    /// Identity of the local site.
    pub fn id(&self) -> SiteId {
        self.id
    }

    /// Number of peer sites, supervisor excluded.
    pub fn count(&self) -> usize {
        self.sites.len() - 1
    }

    pub fn site(&self, id: SiteId) -> Option<&Site> {
        self.sites.get(id as usize)
    }

    pub fn local(&self) -> &Site {
        &self.sites[self.id as usize]
    }

    /// All peer sites except the local one, supervisor excluded.
    pub fn peers(&self) -> impl Iterator<Item = &Site> {
        let id = self.id;
        self.sites
            .iter()
            .filter(move |site| site.id != SUPERVISOR_ID && site.id != id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPOLOGY: &str = "\
        # id endpoint link-speed\n\
        0 127.0.0.1:9000 1048576\n\
        1 127.0.0.1:9001 1048576\n\
        2 127.0.0.1:9002 2097152\n\
        \n\
        3 127.0.0.1:9003 1048576\n";

    #[test]
    fn parses_topology_and_skips_comments() {
        let config = Config::parse(TOPOLOGY, 2).unwrap();
        assert_eq!(config.count(), 3);
        assert_eq!(config.local().addr.port(), 9002);
        let peers: Vec<SiteId> = config.peers().map(|site| site.id).collect();
        assert_eq!(peers, vec![1, 3]);
    }

    #[test]
    fn rejects_gaps_in_site_ids() {
        let text = "0 127.0.0.1:9000 1\n2 127.0.0.1:9002 1\n";
        assert!(matches!(Config::parse(text, 0), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_out_of_range_local_id() {
        let text = "0 127.0.0.1:9000 1\n1 127.0.0.1:9001 1\n";
        assert!(matches!(Config::parse(text, 7), Err(Error::BadSite(7))));
    }

    #[test]
    fn link_delay_scales_with_length() {
        let site = Site {
            id: 1,
            addr: "127.0.0.1:9001".parse().unwrap(),
            link_speed: 1_000_000,
        };
        assert_eq!(site.delay_usec(1000), 1000);
    }
}
