//! Advanced pub/sub: publication history, sample-miss detection, and
//! recovery.
//!
//! An advanced publisher numbers its samples with source info, keeps the
//! last N of them in a cache answerable by query, and can heartbeat its
//! latest sequence number. An advanced subscriber tracks per-source
//! sequence numbers, reports misses, and recovers missing samples by
//! querying the publisher's cache.

pub(crate) mod cache;
pub mod publisher;
pub mod subscriber;

pub use publisher::{AdvancedPublisher, AdvancedPublisherOptions};
pub use subscriber::{AdvancedSubscriber, AdvancedSubscriberOptions, MissEvent};

/// Query parameter carrying the first requested sequence number.
pub(crate) const PARAM_SN_FIRST: &str = "_sn_first";
/// Query parameter carrying the last requested sequence number.
pub(crate) const PARAM_SN_LAST: &str = "_sn_last";

/// Render the recovery-range parameters.
pub(crate) fn sn_range_params(first: u64, last: u64) -> String {
    format!("{PARAM_SN_FIRST}={first}&{PARAM_SN_LAST}={last}")
}

/// Parse the recovery-range parameters; absent bounds mean "open".
pub(crate) fn parse_sn_range(parameters: &str) -> (Option<u64>, Option<u64>) {
    let mut first = None;
    let mut last = None;
    for pair in parameters.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            match key {
                PARAM_SN_FIRST => first = value.parse().ok(),
                PARAM_SN_LAST => last = value.parse().ok(),
                _ => {}
            }
        }
    }
    (first, last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_params_roundtrip() {
        let params = sn_range_params(2, 4);
        assert_eq!(parse_sn_range(&params), (Some(2), Some(4)));
        assert_eq!(parse_sn_range(""), (None, None));
        assert_eq!(parse_sn_range("_sn_first=7"), (Some(7), None));
        assert_eq!(parse_sn_range("other=1&_sn_last=9"), (None, Some(9)));
    }
}
