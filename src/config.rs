//! Static relay configuration
//!
//! Captured once at server construction and never mutated afterwards.

/// Process-wide relay settings.
///
/// `send_origin` selects the fan-out path for post-join traffic: when true,
/// relayed JSON objects are stamped with the sender's numeric ID under the
/// `origin` key. The MOTD fields feed the `motd` message sent to every
/// client right after it joins a channel.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Message of the day, sent after join when non-empty.
    pub motd: String,
    /// Ask clients to always display the MOTD instead of only once.
    pub motd_force_display: bool,
    /// Stamp relayed messages with the sender's ID.
    pub send_origin: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            motd: String::new(),
            motd_force_display: false,
            send_origin: true,
        }
    }
}
