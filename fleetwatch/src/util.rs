//! Small display helpers: human-readable sizes, truncation, compact durations.

pub fn human_kb(kb: u64) -> String {
    const K: f64 = 1024.0;
    let kb = kb as f64;
    if kb < K {
        return format!("{kb:.0}KB");
    }
    let mb = kb / K;
    if mb < K {
        return format!("{mb:.1}MB");
    }
    let gb = mb / K;
    if gb < K {
        return format!("{gb:.1}GB");
    }
    format!("{:.2}TB", gb / K)
}

/// Keep both ends of a long command line, eliding the middle. Counts chars, not bytes.
pub fn truncate_middle(s: &str, max: usize) -> String {
    let n = s.chars().count();
    if n <= max {
        return s.to_string();
    }
    if max <= 3 {
        return "...".into();
    }
    let keep = max - 3;
    let left = keep / 2;
    let right = keep - left;
    let head: String = s.chars().take(left).collect();
    let tail: String = s.chars().skip(n - right).collect();
    format!("{head}...{tail}")
}

/// `2h`, `45min`; whole hours once the span reaches an hour.
pub fn compact_duration(d: chrono::Duration) -> String {
    let mins = d.num_minutes().max(0);
    if mins >= 60 {
        format!("{}h", mins / 60)
    } else {
        format!("{mins}min")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate_middle("short", 10), "short");
        assert_eq!(truncate_middle("/usr/bin/python3 -m http.server", 13), "/usr/...erver");
        assert_eq!(truncate_middle("ççççççççç", 7), "çç...çç");
        assert_eq!(truncate_middle("abcdef", 2), "...");
    }

    #[test]
    fn durations_and_sizes() {
        assert_eq!(compact_duration(chrono::Duration::minutes(45)), "45min");
        assert_eq!(compact_duration(chrono::Duration::minutes(150)), "2h");
        assert_eq!(human_kb(512), "512KB");
        assert_eq!(human_kb(2048), "2.0MB");
    }
}
