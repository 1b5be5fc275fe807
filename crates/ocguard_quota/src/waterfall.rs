//! Quota arithmetic: remaining traffic of the active package and the ordered
//! consumption of reserved packages once there is no active one.

use ocguard_common::db::{Connection, Id, Package};

/// Traffic reported for a user within one polling cycle.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TrafficUsage {
    pub download: i64,
    pub upload: i64,
}

impl TrafficUsage {
    #[must_use]
    pub fn new(download: i64, upload: i64) -> Self {
        Self { download, upload }
    }

    /// Sum cumulative counters of a user's live connections.
    pub fn from_connections<'a, I, T>(connections: T) -> Self
    where
        I: 'a,
        T: IntoIterator<Item = &'a Connection<I>>,
    {
        connections
            .into_iter()
            .fold(Self::default(), |usage, connection| Self {
                download: usage.download + connection.download_traffic_usage,
                upload: usage.upload + connection.upload_traffic_usage,
            })
    }

    #[must_use]
    pub fn total(&self) -> i64 {
        self.download + self.upload
    }

    /// Divide `amount` into download and upload parts proportionally to this
    /// usage. Both parts are truncated toward zero; with no recorded usage
    /// nothing is attributed to either side.
    #[must_use]
    pub fn split(&self, amount: i64) -> (i64, i64) {
        let total = self.total();
        if total == 0 {
            return (0, 0);
        }
        let download_share = self.download as f64 / total as f64;
        let upload_share = self.upload as f64 / total as f64;

        (
            (amount as f64 * download_share) as i64,
            (amount as f64 * upload_share) as i64,
        )
    }
}

/// Traffic left in the active package after charging `usage`.
///
/// Without an active package nothing is left and the result is `-usage`.
#[must_use]
pub fn remaining_traffic(active: Option<&Package<Id>>, usage: i64) -> i64 {
    match active {
        Some(package) => package.traffic_limit - (package.used_traffic() + usage),
        None => -usage,
    }
}

/// Charge to be added to a single package.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Debit {
    pub package_id: Id,
    pub download: i64,
    pub upload: i64,
}

impl Debit {
    #[must_use]
    pub fn total(&self) -> i64 {
        self.download + self.upload
    }
}

/// Result of spreading an overage over reserved packages.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CascadePlan {
    pub debits: Vec<Debit>,
    // overage left once every reserved package was consumed
    pub unabsorbed: i64,
}

impl CascadePlan {
    #[must_use]
    pub fn is_fully_absorbed(&self) -> bool {
        self.unabsorbed <= 0
    }
}

/// Plan how reserved packages absorb `overage` bytes.
///
/// Packages are consumed shortest nominal duration first. A package whose
/// limit exceeds what is still unabsorbed takes the rest and ends the walk,
/// otherwise it is charged its whole limit and the walk continues.
#[must_use]
pub fn plan_cascade(reserved: &[Package<Id>], overage: i64, usage: TrafficUsage) -> CascadePlan {
    let mut ordered: Vec<&Package<Id>> = reserved.iter().collect();
    ordered.sort_by_key(|package| package.duration_days);

    let mut plan = CascadePlan {
        debits: Vec::new(),
        unabsorbed: overage,
    };

    for package in ordered {
        if plan.unabsorbed <= 0 {
            break;
        }
        let amount = if package.traffic_limit > plan.unabsorbed {
            plan.unabsorbed
        } else {
            package.traffic_limit
        };
        let (download, upload) = usage.split(amount);
        plan.debits.push(Debit {
            package_id: package.id,
            download,
            upload,
        });
        plan.unabsorbed -= amount;
    }

    plan
}
