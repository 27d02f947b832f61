//! Small domain helpers shared across modules: instance naming, extra-args
//! encoding, and human-readable duration formatting for log lines.
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::Rng;
use rand::distr::Alphanumeric;
use std::time::Duration;

/// `xfstests-<user>-<run_id>-<shard_id>`, globally unique within the project.
pub fn instance_name(user: &str, run_id: &str, shard_id: &str) -> String {
    format!("xfstests-{user}-{run_id}-{shard_id}")
}

/// Encodes a shard's extra arguments as the single base64 blob carried on
/// `ShardSpec::extra_args_b64`.
pub fn encode_extra_args(extra_args: &[String]) -> String {
    BASE64.encode(extra_args.join(" "))
}

pub fn decode_extra_args(encoded: &str) -> Option<Vec<String>> {
    let bytes = BASE64.decode(encoded).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    Some(text.split_whitespace().map(str::to_string).collect())
}

/// `letters[i/26] + letters[i%26]`: `aa, ab, ..., az, ba, ...`, bounded at 676.
pub fn shard_letters(index: usize) -> String {
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    let hi = LETTERS[(index / 26) % 26] as char;
    let lo = LETTERS[index % 26] as char;
    format!("{hi}{lo}")
}

pub fn random_string(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Renders a duration the way aggregate run-stats and log lines want it:
/// `3661s` style durations collapse to `1h 1m 1s`.
pub fn human_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, rem) = (total / 3600, total % 3600);
    let (m, s) = (rem / 60, rem % 60);
    match (h, m, s) {
        (0, 0, s) => format!("{s}s"),
        (0, m, s) => format!("{m}m {s}s"),
        (h, m, s) => format!("{h}h {m}m {s}s"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn instance_name_shape() {
        assert_eq!(instance_name("alice", "20240501120000", "aa"), "xfstests-alice-20240501120000-aa");
    }

    #[test]
    fn extra_args_round_trip() {
        let args = vec!["-g".to_string(), "quick".to_string()];
        let encoded = encode_extra_args(&args);
        assert_eq!(decode_extra_args(&encoded).unwrap(), args);
    }

    #[test]
    fn shard_letters_sequence() {
        assert_eq!(shard_letters(0), "aa");
        assert_eq!(shard_letters(1), "ab");
        assert_eq!(shard_letters(25), "az");
        assert_eq!(shard_letters(26), "ba");
        assert_eq!(shard_letters(675), "zz");
    }

    #[test]
    fn human_duration_buckets() {
        assert_eq!(human_duration(Duration::from_secs(5)), "5s");
        assert_eq!(human_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(human_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }
}
