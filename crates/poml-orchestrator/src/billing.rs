use poml_config::BillingSettings;
use poml_core::Identity;
use std::collections::HashSet;

/// Hook into the external billing system.
pub trait BillingStatus: Send + Sync {
    fn is_pro(&self, identity: &Identity) -> bool;
}

/// Paid plans taken from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticBilling {
    pro_users: HashSet<String>,
}

impl StaticBilling {
    pub fn new<I, S>(pro_users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pro_users: pro_users.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_settings(settings: &BillingSettings) -> Self {
        Self::new(settings.pro_users.iter().cloned())
    }
}

impl BillingStatus for StaticBilling {
    fn is_pro(&self, identity: &Identity) -> bool {
        match identity {
            Identity::Anonymous => false,
            Identity::Authenticated { id, .. } => self.pro_users.contains(id),
        }
    }
}
