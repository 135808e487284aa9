use chrono::Utc;

/// Wall-clock seconds since the epoch.
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Wall-clock milliseconds since the epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod test {
    use super::{now_millis, now_secs};

    #[test]
    fn clock_units_agree() {
        let secs = now_secs();
        let millis = now_millis();

        assert!((millis / 1000 - secs).abs() <= 1);
    }
}
