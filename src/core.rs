use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Cohort identifier as used by the clinical data model.
pub type CohortId = i64;

/// User-supplied analysis identifier.
pub type AnalysisId = i64;

/// A 32-byte BLAKE3 hash identifying the relevant inputs of a task.
///
/// Two tasks with equal fingerprints are, by construction, the same computation:
/// the fingerprint is derived from the canonical CBOR encoding of everything the
/// task's output depends on, including the fingerprints of its upstream tasks.
/// Analysis identifiers and descriptions never take part in it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Fingerprint([u8; 32]);

impl<T> From<T> for Fingerprint
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Fingerprint(value.into())
    }
}

impl Fingerprint {
    /// Hashes the canonical CBOR encoding of `value`.
    pub(crate) fn of<T: Serialize>(
        value: &T,
    ) -> Result<Self, ciborium::ser::Error<std::io::Error>> {
        let mut hasher = blake3::Hasher::new();
        ciborium::into_writer(value, &mut hasher)?;
        Ok(hasher.finalize().into())
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        let lower_hex = |b: u8| b.is_ascii_digit() || (b'a'..=b'f').contains(&b);
        if hex.len() != 64 || !hex.bytes().all(lower_hex) {
            return None;
        }

        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }

        Some(Fingerprint(bytes))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..12])
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid fingerprint '{hex}'")))
    }
}

/// The closed set of computation stages of the new-user cohort method.
///
/// Shared balance and per-outcome balance are deliberately separate kinds: the
/// former is computed once per target-comparator pair over all covariates, the
/// latter once per outcome over a covariate subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StageKind {
    Extraction,
    StudyPopulation,
    Propensity,
    SharedBalance,
    Adjustment,
    Balance,
    OutcomeModel,
}

impl StageKind {
    pub const ALL: [StageKind; 7] = [
        StageKind::Extraction,
        StageKind::StudyPopulation,
        StageKind::Propensity,
        StageKind::SharedBalance,
        StageKind::Adjustment,
        StageKind::Balance,
        StageKind::OutcomeModel,
    ];

    /// File name prefix of artifacts produced by this stage.
    pub const fn prefix(self) -> &'static str {
        match self {
            StageKind::Extraction => "CmData",
            StageKind::StudyPopulation => "StudyPop",
            StageKind::Propensity => "Ps",
            StageKind::SharedBalance => "SharedBalance",
            StageKind::Adjustment => "StratPop",
            StageKind::Balance => "Balance",
            StageKind::OutcomeModel => "Om",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        StageKind::ALL.into_iter().find(|kind| kind.prefix() == prefix)
    }

    /// Whether a task of this kind exists once per outcome.
    pub const fn is_per_outcome(self) -> bool {
        matches!(
            self,
            StageKind::Adjustment | StageKind::Balance | StageKind::OutcomeModel
        )
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Identity of an artifact: the stage that produces it and its fingerprint.
///
/// The file name is a pure function of this pair, so an existing store
/// directory can be matched against a freshly computed plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArtifactId {
    pub stage: StageKind,
    pub fingerprint: Fingerprint,
}

pub(crate) const ARTIFACT_EXT: &str = "cbor";

impl ArtifactId {
    pub fn new(stage: StageKind, fingerprint: Fingerprint) -> Self {
        Self { stage, fingerprint }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}.{}",
            self.stage.prefix(),
            self.fingerprint.to_hex(),
            ARTIFACT_EXT
        )
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.stage, self.fingerprint)
    }
}

impl FromStr for ArtifactId {
    type Err = ();

    /// Parses a file name produced by [`ArtifactId::file_name`].
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let stem = name
            .strip_suffix(ARTIFACT_EXT)
            .and_then(|s| s.strip_suffix('.'))
            .ok_or(())?;
        let (prefix, hex) = stem.rsplit_once('_').ok_or(())?;
        let stage = StageKind::from_prefix(prefix).ok_or(())?;
        let fingerprint = Fingerprint::from_hex(hex).ok_or(())?;

        Ok(ArtifactId { stage, fingerprint })
    }
}
