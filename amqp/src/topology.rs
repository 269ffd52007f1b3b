use crate::command::ServerId;
use crate::config::Config;
use crate::error::AmqpError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    pub name: String,
    pub primary: bool,
    pub servers: Vec<ServerId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    pub id: ServerId,
    pub zone: String,
    pub url: String,
}

/// Zones in failover order; a server id is its index in `servers`.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    zones: Vec<Zone>,
    servers: Vec<ServerAddr>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let mut topology = Topology::new();
        for zone in config.zones.iter() {
            topology.add_zone(&zone.name).primary = zone.primary;
            for url in zone.servers.iter() {
                topology.add_server(&zone.name, url);
            }
        }
        topology
    }

    /// Only meant for configuration time. Adding a zone that already exists
    /// returns the existing one.
    pub fn add_zone(&mut self, name: &str) -> &mut Zone {
        let i = match self.zones.iter().position(|z| z.name == name) {
            Some(i) => i,
            None => {
                self.zones.push(Zone {
                    name: name.to_string(),
                    primary: false,
                    servers: Vec::new(),
                });
                self.zones.len() - 1
            }
        };
        &mut self.zones[i]
    }

    pub fn add_server(&mut self, zone: &str, url: &str) -> ServerId {
        let id = self.servers.len();
        self.servers.push(ServerAddr {
            id,
            zone: zone.to_string(),
            url: url.to_string(),
        });
        self.add_zone(zone).servers.push(id);
        id
    }

    pub fn primary_zone(&self) -> Result<&Zone, AmqpError> {
        self.zones
            .iter()
            .find(|z| z.primary)
            .ok_or(AmqpError::NoPrimaryZone)
    }

    pub fn zone(&self, name: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.name == name)
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn servers(&self) -> &[ServerAddr] {
        &self.servers
    }

    pub fn server(&self, id: ServerId) -> Option<&ServerAddr> {
        self.servers.get(id)
    }

    /// The primary zone first, then the zones after it, wrapping around.
    pub fn failover_order(&self) -> Result<Vec<&Zone>, AmqpError> {
        let start = self
            .zones
            .iter()
            .position(|z| z.primary)
            .ok_or(AmqpError::NoPrimaryZone)?;
        Ok(self.zones[start..]
            .iter()
            .chain(self.zones[..start].iter())
            .collect())
    }

    /// Every healthy server, in the order a new command should try them.
    pub fn candidates(
        &self,
        healthy: impl Fn(ServerId) -> bool,
    ) -> Result<Vec<ServerId>, AmqpError> {
        let candidates: Vec<ServerId> = self
            .failover_order()?
            .into_iter()
            .flat_map(|zone| zone.servers.iter().copied())
            .filter(|id| healthy(*id))
            .collect();
        if candidates.is_empty() {
            return Err(AmqpError::NoAvailableServer);
        }
        Ok(candidates)
    }

    /// The first healthy server of every zone that has one.
    pub fn per_zone(&self, healthy: impl Fn(ServerId) -> bool) -> Vec<ServerId> {
        self.zones
            .iter()
            .filter_map(|zone| zone.servers.iter().copied().find(|id| healthy(*id)))
            .collect()
    }
}
