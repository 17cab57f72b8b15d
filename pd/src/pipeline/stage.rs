//! Stage kinds and the pipeline dependency graph

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

/// One pipeline stage kind; each maps to one agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    TextExtractor,
    MetadataEnhancer,
    Summarizer,
    ConceptExplainer,
    QualityChecker,
    CitationFormatter,
    Discoverer,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::TextExtractor => "text-extractor",
            AgentKind::MetadataEnhancer => "metadata-enhancer",
            AgentKind::Summarizer => "summarizer",
            AgentKind::ConceptExplainer => "concept-explainer",
            AgentKind::QualityChecker => "quality-checker",
            AgentKind::CitationFormatter => "citation-formatter",
            AgentKind::Discoverer => "discoverer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text-extractor" => Some(AgentKind::TextExtractor),
            "metadata-enhancer" => Some(AgentKind::MetadataEnhancer),
            "summarizer" => Some(AgentKind::Summarizer),
            "concept-explainer" => Some(AgentKind::ConceptExplainer),
            "quality-checker" => Some(AgentKind::QualityChecker),
            "citation-formatter" => Some(AgentKind::CitationFormatter),
            "discoverer" => Some(AgentKind::Discoverer),
            _ => None,
        }
    }

    pub fn all() -> [AgentKind; 7] {
        [
            AgentKind::TextExtractor,
            AgentKind::MetadataEnhancer,
            AgentKind::Summarizer,
            AgentKind::ConceptExplainer,
            AgentKind::QualityChecker,
            AgentKind::CitationFormatter,
            AgentKind::Discoverer,
        ]
    }

    /// Static upstream dependencies of this stage
    pub fn dependencies(&self) -> &'static [AgentKind] {
        match self {
            AgentKind::TextExtractor => &[],
            AgentKind::MetadataEnhancer => &[AgentKind::TextExtractor],
            AgentKind::Summarizer => &[AgentKind::TextExtractor, AgentKind::MetadataEnhancer],
            AgentKind::ConceptExplainer => &[AgentKind::Summarizer],
            AgentKind::QualityChecker => &[AgentKind::Summarizer],
            AgentKind::CitationFormatter => &[AgentKind::TextExtractor],
            AgentKind::Discoverer => &[AgentKind::MetadataEnhancer],
        }
    }

    /// Transitive downstream closure of this stage within `requested`
    pub fn downstream_of(&self, requested: &[AgentKind]) -> Vec<AgentKind> {
        let mut closure: HashSet<AgentKind> = HashSet::new();
        let mut changed = true;
        while changed {
            changed = false;
            for kind in requested {
                if closure.contains(kind) || kind == self {
                    continue;
                }
                let depends_on_failed = kind
                    .dependencies()
                    .iter()
                    .any(|dep| dep == self || closure.contains(dep));
                if depends_on_failed {
                    closure.insert(*kind);
                    changed = true;
                }
            }
        }

        let mut result: Vec<_> = closure.into_iter().collect();
        result.sort();
        result
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One node of a materialized pipeline DAG
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    pub kind: AgentKind,
    pub dependencies: Vec<AgentKind>,
    /// Whether each dependency must run in this request, or may be
    /// satisfied from a cached upstream result
    pub satisfied_from_cache: Vec<AgentKind>,
}

/// Validate that the requested stages form a runnable DAG
///
/// Every dependency of a requested stage must be requested itself or
/// present in `cached` (a prior run's memoized output). The static graph
/// is acyclic by construction, but the check guards against future edits
/// to the dependency table.
pub fn validate_stages(
    requested: &[AgentKind],
    cached: &BTreeSet<AgentKind>,
) -> Result<Vec<StageDescriptor>, String> {
    if requested.is_empty() {
        return Err("no stages requested".to_string());
    }

    let mut seen = HashSet::new();
    for kind in requested {
        if !seen.insert(*kind) {
            return Err(format!("stage {kind} requested twice"));
        }
    }

    validate_acyclic(requested)?;

    let mut descriptors = Vec::new();
    for kind in requested {
        let mut satisfied_from_cache = Vec::new();
        for dep in kind.dependencies() {
            if seen.contains(dep) {
                continue;
            }
            if cached.contains(dep) {
                satisfied_from_cache.push(*dep);
                continue;
            }
            return Err(format!(
                "stage {kind} depends on {dep}, which is neither requested nor cached"
            ));
        }
        descriptors.push(StageDescriptor {
            kind: *kind,
            dependencies: kind.dependencies().to_vec(),
            satisfied_from_cache,
        });
    }

    Ok(descriptors)
}

/// DFS cycle check over the static dependency table
fn validate_acyclic(requested: &[AgentKind]) -> Result<(), String> {
    fn visit(
        kind: AgentKind,
        visiting: &mut HashSet<AgentKind>,
        visited: &mut HashSet<AgentKind>,
    ) -> Result<(), String> {
        if visited.contains(&kind) {
            return Ok(());
        }
        if !visiting.insert(kind) {
            return Err(format!("dependency cycle through {kind}"));
        }
        for dep in kind.dependencies() {
            visit(*dep, visiting, visited)?;
        }
        visiting.remove(&kind);
        visited.insert(kind);
        Ok(())
    }

    let mut visiting = HashSet::new();
    let mut visited = HashSet::new();
    for kind in requested {
        visit(*kind, &mut visiting, &mut visited)?;
    }
    Ok(())
}

/// Partition requested stages into waves
///
/// A wave contains every stage whose dependencies have settled in earlier
/// waves (or are satisfied from cache / unrequested). Wave order is the
/// dispatch order; stages within a wave run concurrently.
pub fn partition_waves(descriptors: &[StageDescriptor]) -> Vec<Vec<AgentKind>> {
    let requested: HashSet<AgentKind> = descriptors.iter().map(|d| d.kind).collect();
    let mut settled: HashSet<AgentKind> = HashSet::new();
    let mut remaining: Vec<AgentKind> = descriptors.iter().map(|d| d.kind).collect();
    remaining.sort();

    let mut waves = Vec::new();
    while !remaining.is_empty() {
        let ready: Vec<AgentKind> = remaining
            .iter()
            .copied()
            .filter(|kind| {
                kind.dependencies()
                    .iter()
                    .all(|dep| !requested.contains(dep) || settled.contains(dep))
            })
            .collect();

        // validate_stages guarantees progress; an empty wave would mean a
        // cycle slipped through
        debug_assert!(!ready.is_empty(), "wave partition stalled");
        if ready.is_empty() {
            break;
        }

        for kind in &ready {
            settled.insert(*kind);
        }
        remaining.retain(|kind| !settled.contains(kind));
        waves.push(ready);
    }

    waves
}
