//! Ordering for formula version strings.
//!
//! - numeric components compare numerically: `1.10.0 > 1.9.0`
//! - a pre-release sorts before its release: `1.0.0-beta < 1.0.0`
//! - the `_N` suffix breaks ties: `1.0.0 < 1.0.0_1 < 1.0.1`
//! - `HEAD` and `HEAD-<sha>` sort above every numbered release

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone)]
pub struct Version {
    head: bool,
    release: Vec<Segment>,
    pre: Vec<Segment>,
    suffix: u32,
    raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Segment {
    // Declaration order matters: numbers sort before words.
    Num(u64),
    Word(String),
}

impl Version {
    pub fn parse(s: &str) -> Self {
        let raw = s.trim().to_string();

        if raw.starts_with("HEAD") {
            return Version {
                head: true,
                release: Vec::new(),
                pre: Vec::new(),
                suffix: 0,
                raw,
            };
        }

        let (body, suffix) = match raw.rsplit_once('_') {
            Some((body, n)) => match n.parse::<u32>() {
                Ok(n) => (body, n),
                Err(_) => (raw.as_str(), 0),
            },
            None => (raw.as_str(), 0),
        };

        let (release, pre) = match body.split_once('-') {
            Some((release, pre)) => (segments(release), segments(pre)),
            None => (segments(body), Vec::new()),
        };

        Version {
            head: false,
            release,
            pre,
            suffix,
            raw,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_older_than(&self, other: &Version) -> bool {
        self < other
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.head
            .cmp(&other.head)
            .then_with(|| compare_padded(&self.release, &other.release))
            .then_with(|| match (self.pre.is_empty(), other.pre.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => compare_padded(&self.pre, &other.pre),
            })
            .then_with(|| self.suffix.cmp(&other.suffix))
    }
}

/// Trailing zeros don't matter: `1.0 == 1.0.0`.
fn compare_padded(a: &[Segment], b: &[Segment]) -> Ordering {
    let zero = Segment::Num(0);
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let x = a.get(i).unwrap_or(&zero);
            let y = b.get(i).unwrap_or(&zero);
            x.cmp(y)
        })
        .find(|ord| *ord != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

fn segments(s: &str) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut current = String::new();

    let flush = |current: &mut String, out: &mut Vec<Segment>| {
        if current.is_empty() {
            return;
        }
        let seg = match current.parse::<u64>() {
            Ok(n) => Segment::Num(n),
            Err(_) => Segment::Word(current.to_lowercase()),
        };
        out.push(seg);
        current.clear();
    };

    for c in s.chars() {
        if !c.is_alphanumeric() {
            flush(&mut current, &mut out);
            continue;
        }
        let switching = current
            .chars()
            .last()
            .is_some_and(|last| last.is_ascii_digit() != c.is_ascii_digit());
        if switching {
            flush(&mut current, &mut out);
        }
        current.push(c);
    }
    flush(&mut current, &mut out);

    out
}

/// An installed formula with a newer version available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutdatedPackage {
    pub name: String,
    pub installed_version: String,
    pub available_version: String,
}
