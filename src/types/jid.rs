use serde::{Deserialize, Serialize};
use std::fmt;

/// Individual user server
pub const DEFAULT_USER_SERVER: &str = "s.whatsapp.net";
/// Group server
pub const GROUP_SERVER: &str = "g.us";
/// Linked-identity server, used for multi-account presence
pub const LID_SERVER: &str = "lid";
/// Status broadcast server
pub const BROADCAST_SERVER: &str = "broadcast";

/// JID represents a WhatsApp user or group identifier.
///
/// Device 0 is the primary; additional devices are multi-device
/// companions. Wire format is `user[:device]@server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JID {
    pub user: String,
    pub device: u16,
    pub server: String,
}

impl JID {
    /// Create a new primary-device JID
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            device: 0,
            server: server.into(),
        }
    }

    /// Create a new group JID
    pub fn new_group(group_id: &str) -> Self {
        Self::new(group_id, GROUP_SERVER)
    }

    /// Parse a JID from the wire format `user[:device]@server`
    pub fn parse(jid_str: &str) -> Result<Self, crate::error::Error> {
        jid_str.parse()
    }

    /// Return a copy addressing the given device of the same user
    pub fn with_device(&self, device: u16) -> Self {
        Self {
            user: self.user.clone(),
            device,
            server: self.server.clone(),
        }
    }

    /// Check if this is an individual user JID
    pub fn is_user(&self) -> bool {
        self.server == DEFAULT_USER_SERVER
    }

    /// Check if this is a group JID
    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    /// Check if this is a linked-identity JID
    pub fn is_lid(&self) -> bool {
        self.server == LID_SERVER
    }

    /// Check if this is a broadcast JID
    pub fn is_broadcast(&self) -> bool {
        self.server == BROADCAST_SERVER
    }

    /// Check if this is the status broadcast list
    pub fn is_status_broadcast(&self) -> bool {
        self.is_broadcast() && self.user == "status"
    }

    /// Equality on users, ignoring device
    pub fn same_user(&self, other: &JID) -> bool {
        self.user == other.user && self.server == other.server
    }

    /// The string representation without device info
    pub fn to_non_ad(&self) -> String {
        format!("{}@{}", self.user, self.server)
    }

    /// The Signal protocol address for this device, used as the
    /// `session` store key
    pub fn signal_address(&self) -> String {
        format!("{}.{}", self.user, self.device)
    }
}

impl fmt::Display for JID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.device != 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else {
            write!(f, "{}@{}", self.user, self.server)
        }
    }
}

impl std::str::FromStr for JID {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user_part, server) = s
            .split_once('@')
            .ok_or_else(|| crate::Error::InvalidJid(format!("missing server: {}", s)))?;
        if server.is_empty() || server.contains('@') {
            return Err(crate::Error::InvalidJid(format!("bad server: {}", s)));
        }

        let (user, device) = match user_part.split_once(':') {
            Some((user, device)) => {
                let device = device
                    .parse()
                    .map_err(|_| crate::Error::InvalidJid(format!("bad device: {}", s)))?;
                (user, device)
            }
            None => (user_part, 0),
        };

        Ok(JID {
            user: user.to_string(),
            device,
            server: server.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jid_parsing() {
        let jid_str = "1234567890@s.whatsapp.net";
        let jid = JID::parse(jid_str).unwrap();
        assert_eq!(jid.user, "1234567890");
        assert_eq!(jid.server, "s.whatsapp.net");
        assert_eq!(jid.device, 0);
        assert_eq!(jid.to_string(), jid_str);
    }

    #[test]
    fn test_device_jid_round_trip() {
        let jid: JID = "1234567890:5@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.device, 5);
        assert_eq!(jid.to_string(), "1234567890:5@s.whatsapp.net");
        assert_eq!(jid.to_non_ad(), "1234567890@s.whatsapp.net");
        assert_eq!(jid.signal_address(), "1234567890.5");
    }

    #[test]
    fn test_group_jid() {
        let group_jid = JID::new_group("groupid123");
        assert_eq!(group_jid.server, "g.us");
        assert!(group_jid.is_group());
    }

    #[test]
    fn test_status_broadcast() {
        let jid: JID = "status@broadcast".parse().unwrap();
        assert!(jid.is_broadcast());
        assert!(jid.is_status_broadcast());
    }

    #[test]
    fn test_same_user_ignores_device() {
        let a: JID = "111:3@s.whatsapp.net".parse().unwrap();
        let b: JID = "111@s.whatsapp.net".parse().unwrap();
        assert!(a.same_user(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_jid() {
        assert!(JID::parse("no-server").is_err());
        assert!(JID::parse("u:x@s.whatsapp.net").is_err());
    }
}
