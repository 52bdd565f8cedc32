pub mod crypto;

/// Generate a message id in the mobile-originated format: a fixed prefix
/// followed by 18 uppercase hex characters.
pub fn generate_message_id() -> String {
    let mut bytes = [0u8; 9];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    format!("3EB0{}", hex::encode_upper(bytes))
}

/// Current unix time in whole seconds
pub fn unix_timestamp_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_shape() {
        let id = generate_message_id();
        assert_eq!(id.len(), 4 + 18);
        assert!(id.starts_with("3EB0"));
        assert!(id.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = generate_message_id();
        let b = generate_message_id();
        assert_ne!(a, b);
    }
}
