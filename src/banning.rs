//! IP-level timed bans.
//!
//! Lookups are O(1); expired entries are purged lazily on access so there
//! is no background sweeper to manage.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Deserialize;

use crate::clock::SharedClock;

/// Banning policy bits from the cluster configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BanningConfig {
    /// Ban peers that send unparseable frames.
    pub ban_on_junk_receive: bool,
    /// Ban workers whose invalid-share ratio exceeds `invalid_percent`
    /// within a check window.
    pub ban_on_invalid_shares: bool,
    /// Percentage of invalid shares that triggers a ban.
    pub invalid_percent: f64,
    /// Minimum submissions in the window before the ratio is checked.
    pub check_threshold: u64,
    /// Ban duration for invalid-share offenders, seconds.
    pub ban_duration_secs: u64,
}

impl Default for BanningConfig {
    fn default() -> Self {
        Self {
            ban_on_junk_receive: true,
            ban_on_invalid_shares: true,
            invalid_percent: 50.0,
            check_threshold: 20,
            ban_duration_secs: 600,
        }
    }
}

impl BanningConfig {
    /// Junk frames get a fixed half-hour ban.
    pub fn junk_ban_duration(&self) -> Duration {
        Duration::from_secs(30 * 60)
    }

    pub fn invalid_share_ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }
}

pub struct BanManager {
    clock: SharedClock,
    entries: RwLock<HashMap<IpAddr, std::time::Instant>>,
}

impl BanManager {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ban(&self, addr: IpAddr, duration: Duration) {
        let expires = self.clock.now() + duration;
        let mut entries = self.entries.write();
        let entry = entries.entry(addr).or_insert(expires);
        // Keep the longer of an existing and the new ban.
        if *entry < expires {
            *entry = expires;
        }
        tracing::info!(%addr, secs = duration.as_secs(), "peer banned");
    }

    pub fn is_banned(&self, addr: IpAddr) -> bool {
        let now = self.clock.now();
        {
            let entries = self.entries.read();
            match entries.get(&addr) {
                Some(expires) if *expires > now => return true,
                None => return false,
                Some(_) => {}
            }
        }
        // Expired: purge under the write lock.
        let mut entries = self.entries.write();
        if let Some(expires) = entries.get(&addr).copied() {
            if expires > now {
                return true;
            }
            entries.remove(&addr);
        }
        false
    }

    pub fn banned_count(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn manual() -> (Arc<ManualClock>, BanManager) {
        let clock = Arc::new(ManualClock::new());
        let mgr = BanManager::new(clock.clone());
        (clock, mgr)
    }

    #[test]
    fn ban_expires_and_is_purged() {
        let (clock, mgr) = manual();
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        mgr.ban(addr, Duration::from_secs(60));
        assert!(mgr.is_banned(addr));

        clock.advance(Duration::from_secs(61));
        assert!(!mgr.is_banned(addr));
        assert_eq!(mgr.banned_count(), 0);
    }

    #[test]
    fn longer_ban_is_not_shortened() {
        let (clock, mgr) = manual();
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        mgr.ban(addr, Duration::from_secs(600));
        mgr.ban(addr, Duration::from_secs(10));

        clock.advance(Duration::from_secs(30));
        assert!(mgr.is_banned(addr));
    }

    #[test]
    fn unknown_address_is_not_banned() {
        let (_clock, mgr) = manual();
        assert!(!mgr.is_banned(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
    }
}
