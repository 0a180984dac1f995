//! Generation-qualified cursors and shard object naming
//!
//! A log that has been migrated hands out cursors that must survive the
//! migration: generation 0 cursors pass through untouched so consumers
//! that predate generations keep working, later generations carry an
//! explicit prefix.

/// Qualify `cursor` with the generation it belongs to.
pub fn gencursor(gen_id: u64, cursor: &str) -> String {
    if gen_id == 0 {
        cursor.to_string()
    } else {
        format!("G{:020}@{}", gen_id, cursor)
    }
}

/// Split a cursor into its generation and the backend cursor. Anything
/// that does not parse as a generation prefix belongs to generation 0
/// unchanged.
pub fn cursorgen(cursor: &str) -> (u64, &str) {
    let Some(rest) = cursor.strip_prefix('G') else {
        return (0, cursor);
    };
    let Some((digits, tail)) = rest.split_once('@') else {
        return (0, cursor);
    };
    if digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return (0, cursor);
    }
    match digits.parse::<u64>() {
        Ok(gen_id) => (gen_id, tail),
        Err(_) => (0, cursor),
    }
}

/// Canonical shard object name. Generation 0 keeps the pre-migration
/// layout so existing deployments resolve to the same objects.
pub fn shard_oid(base: &str, gen_id: u64, shard: u32) -> String {
    if gen_id == 0 {
        format!("{}.{}", base, shard)
    } else {
        format!("{}.{}.{}", base, gen_id, shard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_roundtrip() {
        let qualified = gencursor(7, "1_00000000042");
        assert_eq!(cursorgen(&qualified), (7, "1_00000000042"));

        assert_eq!(gencursor(0, "marker"), "marker");
        assert_eq!(cursorgen("marker"), (0, "marker"));
    }

    #[test]
    fn test_malformed_prefixes_belong_to_generation_zero() {
        assert_eq!(cursorgen(""), (0, ""));
        assert_eq!(cursorgen("Gnot-a-number@rest"), (0, "Gnot-a-number@rest"));
        assert_eq!(cursorgen("G123@rest"), (0, "G123@rest"));
        assert_eq!(cursorgen("G00000000000000000007"), (0, "G00000000000000000007"));
    }

    #[test]
    fn test_shard_oid_layout() {
        assert_eq!(shard_oid("data_log", 0, 3), "data_log.3");
        assert_eq!(shard_oid("data_log", 2, 3), "data_log.2.3");
    }
}
