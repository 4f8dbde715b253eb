//! Remediation hints attached to user-visible errors

use serde::{Deserialize, Serialize};
use std::fmt;

/// A documentation topic that explains how to fix a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HelpTopic {
    /// A firewall rule must allow traffic from the relay's address range
    CreateIapFirewallRule,
    /// The user needs the tunnel user role on the instance or project
    IapAccess,
    /// The user needs an OS Login role to publish keys
    OsLoginRoles,
}

impl HelpTopic {
    /// Short title for the topic
    pub fn title(self) -> &'static str {
        match self {
            HelpTopic::CreateIapFirewallRule => "Create a firewall rule for Cloud IAP",
            HelpTopic::IapAccess => "Grant access to Cloud IAP TCP forwarding",
            HelpTopic::OsLoginRoles => "Grant OS Login roles",
        }
    }

    /// Documentation address for the topic
    pub fn url(self) -> &'static str {
        match self {
            HelpTopic::CreateIapFirewallRule => {
                "https://cloud.google.com/iap/docs/using-tcp-forwarding#create-firewall-rule"
            }
            HelpTopic::IapAccess => {
                "https://cloud.google.com/iap/docs/using-tcp-forwarding#grant-permission"
            }
            HelpTopic::OsLoginRoles => {
                "https://cloud.google.com/compute/docs/oslogin/set-up-oslogin#configure_users"
            }
        }
    }
}

impl fmt::Display for HelpTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.title(), self.url())
    }
}
