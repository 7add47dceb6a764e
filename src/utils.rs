use {
    chrono::{DateTime, Utc},
    relay_rpc::{
        auth::ed25519_dalek::VerifyingKey,
        domain::{DecodedClientId, Topic},
    },
    std::time::Duration,
};

pub fn topic_from_key(key: &[u8]) -> Topic {
    sha256::digest(key).into()
}

pub fn get_client_id(verifying_key: &VerifyingKey) -> DecodedClientId {
    DecodedClientId(verifying_key.to_bytes())
}

/// Unix seconds, as used in JWT claims and subscription expiries.
pub fn unix_timestamp(time: DateTime<Utc>) -> u64 {
    time.timestamp().unsigned_abs()
}

pub fn add_ttl(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero())
}

pub fn from_unix_timestamp(secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_is_sha256_hex_of_key() {
        let topic = topic_from_key(&[0u8; 32]);
        assert_eq!(
            topic.to_string(),
            "66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925"
        );
    }

    #[test]
    fn unix_round_trip() {
        let time = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(from_unix_timestamp(unix_timestamp(time)), time);
        assert_eq!(from_unix_timestamp(u64::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
