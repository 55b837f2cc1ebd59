use crate::diff::DiffEntry;
use crate::tag::render_template;
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

static VALIDATOR_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-f]{96}$").expect("validator key pattern is valid"));

const DEFAULT_IDENTITY: &str = "default";

/// A validator BLS public key as written in the graffiti file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorKey(String);

impl ValidatorKey {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches('\r');
        VALIDATOR_KEY
            .is_match(line)
            .then(|| Self(line.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ValidatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keeps the well-formed keys of a one-per-line list, silently skipping the rest.
pub fn parse_validator_list(raw: &str) -> Vec<ValidatorKey> {
    raw.lines().filter_map(ValidatorKey::parse).collect()
}

/// One `<identity>: <graffiti>` line for `default` and then for every key.
/// Each identity rolls its own pending pixel, so keys spread over the diff.
/// Pixels that can't be written as a `gw:` tag are never handed out.
pub fn build_instructions<R: Rng + ?Sized>(
    diff: &[DiffEntry],
    validators: &[ValidatorKey],
    template: &str,
    rng: &mut R,
) -> Vec<String> {
    let diff: Vec<&DiffEntry> = diff.iter().filter(|e| e.fits_compact_tag()).collect();
    let identities =
        std::iter::once(DEFAULT_IDENTITY).chain(validators.iter().map(ValidatorKey::as_str));
    identities
        .map(|identity| {
            let graffiti = render_template(template, diff.choose(&mut *rng).copied());
            format!("{identity}: {graffiti}")
        })
        .collect()
}

/// The graffiti file handed to the validator client.
#[derive(Debug, Clone)]
pub struct InstructionFile {
    path: PathBuf,
    template: String,
    validators: Option<PathBuf>,
}

impl InstructionFile {
    pub fn new(path: impl Into<PathBuf>, template: impl Into<String>, validators: Option<PathBuf>) -> Self {
        Self {
            path: path.into(),
            template: template.into(),
            validators,
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Re-read on every rebuild so key list edits apply without a restart.
    pub fn load_validators(&self) -> Vec<ValidatorKey> {
        let Some(path) = &self.validators else {
            return Vec::new();
        };
        match fs::read_to_string(path) {
            Ok(raw) => parse_validator_list(&raw),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not read validator list, using default only");
                Vec::new()
            }
        }
    }

    pub fn rebuild<R: Rng + ?Sized>(&self, diff: &[DiffEntry], rng: &mut R) -> Result<()> {
        let validators = self.load_validators();
        let lines = build_instructions(diff, &validators, &self.template, rng);
        fs::write(&self.path, lines.join("\n"))
            .with_context(|| format!("failed to write graffiti file: {}", self.path.display()))?;
        info!(
            "Rebuilt graffiti file ({} diffs, {} keys) {}",
            diff.len(),
            validators.len(),
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{Color, Position};
    use rand::rngs::mock::StepRng;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn key(fill: char) -> String {
        format!("0x{}", fill.to_string().repeat(96))
    }

    fn entry(x: u32, y: u32, color: &str) -> DiffEntry {
        DiffEntry {
            position: Position::new(x, y),
            color: Color::parse(color).unwrap(),
        }
    }

    #[test]
    fn validator_filter() {
        assert!(ValidatorKey::parse("0xdeadbeef").is_none());
        assert!(ValidatorKey::parse(&key('a')).is_some());
        assert!(ValidatorKey::parse(&key('A')).is_none());
        assert!(ValidatorKey::parse(&format!("{}0", key('1'))).is_none());
        assert!(ValidatorKey::parse(&format!("{}\r", key('1'))).is_some());
        assert!(ValidatorKey::parse(&format!("  {}", key('1'))).is_none());
        assert!(ValidatorKey::parse(&format!("{} ", key('1'))).is_none());
        assert!(ValidatorKey::parse("").is_none());
    }

    #[test]
    fn validator_list_skips_bad_lines() {
        let raw = format!("{}\n0xdeadbeef\n\n# comment\n{}\n", key('a'), key('b'));
        let keys = parse_validator_list(&raw);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].as_str(), key('a'));
        assert_eq!(keys[1].as_str(), key('b'));
    }

    #[test]
    fn empty_diff_renders_empty_payload_for_everyone() {
        let validators = parse_validator_list(&format!("{}\n{}", key('a'), key('b')));
        let mut rng = StdRng::seed_from_u64(7);
        let lines = build_instructions(&[], &validators, "Pool <gw>", &mut rng);
        assert_eq!(
            lines,
            vec![
                "default: Pool ".to_string(),
                format!("{}: Pool ", key('a')),
                format!("{}: Pool ", key('b')),
            ]
        );
    }

    #[test]
    fn injected_rng_decides_the_pixel() {
        let diff = vec![entry(1, 2, "aaaaaa"), entry(3, 4, "bbbbbb")];
        let mut rng = StepRng::new(0, 0);
        let lines = build_instructions(&diff, &[], "<gw>", &mut rng);
        assert_eq!(lines, vec!["default: gw:001002aaaaaa".to_string()]);
    }

    #[test]
    fn pixels_past_999_are_never_handed_out() {
        let diff = vec![entry(1000, 5, "abcdef"), entry(7, 1200, "abcdef")];
        let mut rng = StdRng::seed_from_u64(5);
        let lines = build_instructions(&diff, &[], "<gw>", &mut rng);
        assert_eq!(lines, vec!["default: ".to_string()]);

        let diff = vec![entry(1000, 5, "abcdef"), entry(999, 999, "010101")];
        for seed in 0..16 {
            let mut rng = StdRng::seed_from_u64(seed);
            let lines = build_instructions(&diff, &[], "<gw>", &mut rng);
            assert_eq!(lines, vec!["default: gw:999999010101".to_string()]);
        }
    }

    #[test]
    fn every_identity_gets_a_pixel_from_the_diff() {
        let diff = vec![entry(1, 2, "aaaaaa"), entry(3, 4, "bbbbbb"), entry(5, 6, "cccccc")];
        let validators = parse_validator_list(&format!("{}\n{}", key('c'), key('d')));
        let mut rng = StdRng::seed_from_u64(42);
        let lines = build_instructions(&diff, &validators, "<gw>", &mut rng);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("default: gw:"));
        for line in &lines {
            let (_, graffiti) = line.split_once(": ").unwrap();
            assert!(["gw:001002aaaaaa", "gw:003004bbbbbb", "gw:005006cccccc"].contains(&graffiti));
        }
    }

    #[test]
    fn rebuild_writes_one_line_per_identity() {
        let dir = tempdir().unwrap();
        let validators = dir.path().join("validators.txt");
        fs::write(&validators, format!("0xdeadbeef\n{}\n", key('e'))).unwrap();
        let out = InstructionFile::new(dir.path().join("graffiti.txt"), "<gw>", Some(validators));

        let diff = vec![entry(9, 9, "010203")];
        out.rebuild(&diff, &mut StdRng::seed_from_u64(1)).unwrap();

        let written = fs::read_to_string(out.path()).unwrap();
        assert_eq!(
            written,
            format!("default: gw:009009010203\n{}: gw:009009010203", key('e'))
        );
    }

    #[test]
    fn missing_validator_list_falls_back_to_default() {
        let dir = tempdir().unwrap();
        let out = InstructionFile::new(
            dir.path().join("graffiti.txt"),
            "x<gw>",
            Some(dir.path().join("missing.txt")),
        );
        out.rebuild(&[], &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(fs::read_to_string(out.path()).unwrap(), "default: x");
    }
}
