use uuid::Uuid;

/// Mints a new time-sortable identifier (UUIDv7) for sessions, messages'
/// externally-visible grouping keys, and attachments.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_well_formed() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
    }
}
