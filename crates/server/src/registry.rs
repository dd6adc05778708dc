//! In-memory tool registry with domain/group organization.
//!
//! The registry keeps two indices: a per-domain slice (`domain -> name ->
//! entry`) and a flat `name -> entry` map used for lookups. Both are guarded
//! by one `RwLock`; `populate_domain` replaces a domain's slice in a single
//! write-lock section, so readers observe either the previous snapshot or the
//! new one, never a mix.
//!
//! Cross-domain name collisions are resolved by re-keying both entries as
//! `{domain}_{original_name}`. An original name that collided once stays
//! "claimed": later domains registering it are prefixed immediately, and the
//! bare name is never resurrected in the flat index.

use crate::fuzzy;
use parking_lot::RwLock;
use rmcp::model::ToolAnnotations;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// A single tool in the registry.
#[derive(Debug, Clone)]
pub struct ToolEntry {
    /// Gateway-facing name, possibly domain-prefixed after collision
    /// resolution. Globally unique.
    pub name: String,
    /// The name as registered by the upstream; used on the wire when the
    /// gateway talks to that upstream.
    pub original_name: String,
    /// Domain of the owning upstream.
    pub domain: String,
    /// Optional sub-category within the domain.
    pub group: Option<String>,
    /// Human-readable description, intended for LLM consumption.
    pub description: String,
    /// JSON Schema object describing the tool's parameters.
    pub input_schema: JsonMap<String, Value>,
    /// MCP tool annotations (`readOnlyHint`, `openWorldHint`, ...).
    pub annotations: Option<ToolAnnotations>,
}

/// Tool metadata as discovered from an upstream, before collision
/// resolution assigns the gateway-facing name.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub group: Option<String>,
    pub input_schema: JsonMap<String, Value>,
    pub annotations: Option<ToolAnnotations>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            group: None,
            input_schema: JsonMap::new(),
            annotations: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_schema(mut self, schema: JsonMap<String, Value>) -> Self {
        self.input_schema = schema;
        self
    }
}

/// Summary information about a domain.
#[derive(Debug, Clone, Serialize)]
pub struct DomainInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub tool_count: usize,
    pub groups: Vec<String>,
}

/// Per-domain report of changes produced by a (re-)population.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RegistryDiff {
    pub domain: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub tool_count: usize,
}

impl RegistryDiff {
    /// True when the population changed nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Outcome of resolving a tool name that may be misspelled.
#[derive(Debug)]
pub enum Resolution {
    /// Exact hit in the flat index.
    Exact(Arc<ToolEntry>),
    /// No exact hit, but one candidate cleared the similarity threshold.
    Fuzzy(Arc<ToolEntry>),
    /// No acceptable candidate; carries ranked suggestions (possibly empty).
    Miss(Vec<String>),
}

#[derive(Default)]
struct DomainSlice {
    description: Option<String>,
    tools: BTreeMap<String, Arc<ToolEntry>>,
}

#[derive(Default)]
struct Inner {
    domains: BTreeMap<String, DomainSlice>,
    flat: HashMap<String, Arc<ToolEntry>>,
    /// Original names that ever collided across domains.
    claimed: HashSet<String>,
}

/// Thread-safe in-memory tool registry.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<Inner>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entire slice for `domain` atomically and report the diff
    /// versus the previous snapshot.
    pub fn populate_domain(
        &self,
        domain: &str,
        specs: Vec<ToolSpec>,
        description: Option<String>,
    ) -> RegistryDiff {
        let mut inner = self.inner.write();

        let prev_names: BTreeSet<String> = inner
            .domains
            .get(domain)
            .map(|slice| slice.tools.keys().cloned().collect())
            .unwrap_or_default();
        for name in &prev_names {
            inner.flat.remove(name);
        }

        let mut new_tools: BTreeMap<String, Arc<ToolEntry>> = BTreeMap::new();
        for spec in specs {
            let Some(key) = resolve_collisions(&mut inner, &new_tools, domain, &spec.name) else {
                continue;
            };
            let entry = Arc::new(ToolEntry {
                name: key.clone(),
                original_name: spec.name,
                domain: domain.to_string(),
                group: spec.group,
                description: spec.description,
                input_schema: spec.input_schema,
                annotations: spec.annotations,
            });
            new_tools.insert(key, entry);
        }

        let new_names: BTreeSet<String> = new_tools.keys().cloned().collect();
        for (name, entry) in &new_tools {
            inner.flat.insert(name.clone(), Arc::clone(entry));
        }
        inner.domains.insert(
            domain.to_string(),
            DomainSlice {
                description,
                tools: new_tools,
            },
        );

        RegistryDiff {
            domain: domain.to_string(),
            added: new_names.difference(&prev_names).cloned().collect(),
            removed: prev_names.difference(&new_names).cloned().collect(),
            tool_count: new_names.len(),
        }
    }

    /// Drop all entries for `domain`. Unknown domains are a no-op.
    pub fn remove_domain(&self, domain: &str) {
        let mut inner = self.inner.write();
        if let Some(slice) = inner.domains.remove(domain) {
            for name in slice.tools.keys() {
                inner.flat.remove(name);
            }
        }
    }

    /// Exact lookup from the flat index.
    pub fn get(&self, name: &str) -> Option<Arc<ToolEntry>> {
        self.inner.read().flat.get(name).cloned()
    }

    /// Resolve `name`, falling back to fuzzy matching over `candidates` on
    /// an exact miss. `candidates` is the set of names visible to the
    /// caller (hooks may have hidden some).
    pub fn resolve(&self, name: &str, candidates: &[String]) -> Resolution {
        if candidates.iter().any(|c| c == name) {
            if let Some(entry) = self.get(name) {
                return Resolution::Exact(entry);
            }
        }
        if let Some(best) = fuzzy::best_match(name, candidates) {
            if let Some(entry) = self.get(best) {
                return Resolution::Fuzzy(entry);
            }
        }
        Resolution::Miss(fuzzy::suggest(name, candidates, fuzzy::MAX_SUGGESTIONS))
    }

    /// Keyword search across tool names and descriptions. Every whitespace
    /// token of `query` must appear (case-insensitively) in the tool's name
    /// or description. Results are ordered by `(domain, name)`.
    pub fn search(&self, query: &str) -> Vec<Arc<ToolEntry>> {
        let tokens: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        let inner = self.inner.read();
        let mut results: Vec<Arc<ToolEntry>> = inner
            .flat
            .values()
            .filter(|entry| {
                let haystack =
                    format!("{} {}", entry.name, entry.description).to_lowercase();
                tokens.iter().all(|t| haystack.contains(t))
            })
            .cloned()
            .collect();
        results.sort_by(|a, b| (&a.domain, &a.name).cmp(&(&b.domain, &b.name)));
        results
    }

    /// Snapshot of all domains with tool counts and group sets.
    pub fn list_domains(&self) -> Vec<DomainInfo> {
        let inner = self.inner.read();
        inner
            .domains
            .iter()
            .map(|(name, slice)| DomainInfo {
                name: name.clone(),
                description: slice.description.clone(),
                tool_count: slice.tools.len(),
                groups: group_set(slice),
            })
            .collect()
    }

    /// All tools in `domain`, ordered by name. `None` if the domain is
    /// unknown.
    pub fn tools_in_domain(&self, domain: &str) -> Option<Vec<Arc<ToolEntry>>> {
        let inner = self.inner.read();
        inner
            .domains
            .get(domain)
            .map(|slice| slice.tools.values().cloned().collect())
    }

    /// Group names present in `domain`, sorted. `None` if the domain is
    /// unknown.
    pub fn groups_in_domain(&self, domain: &str) -> Option<Vec<String>> {
        let inner = self.inner.read();
        inner.domains.get(domain).map(group_set)
    }

    pub fn has_domain(&self, domain: &str) -> bool {
        self.inner.read().domains.contains_key(domain)
    }

    pub fn domain_description(&self, domain: &str) -> Option<String> {
        self.inner
            .read()
            .domains
            .get(domain)
            .and_then(|slice| slice.description.clone())
    }

    /// All registered domain names, sorted.
    pub fn domain_names(&self) -> Vec<String> {
        self.inner.read().domains.keys().cloned().collect()
    }

    /// All gateway-facing tool names, sorted (fuzzy-match candidates).
    pub fn all_names(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner.flat.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every tool entry, ordered by `(domain, name)`.
    pub fn all_tools(&self) -> Vec<Arc<ToolEntry>> {
        let inner = self.inner.read();
        inner
            .domains
            .values()
            .flat_map(|slice| slice.tools.values().cloned())
            .collect()
    }

    pub fn tool_count(&self) -> usize {
        self.inner.read().flat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().flat.is_empty()
    }
}

/// Pick the flat-index key for `original_name` arriving from `domain`,
/// re-keying a colliding entry from another domain when needed.
///
/// Returns `None` when the name cannot be registered at all (secondary
/// collision); the caller drops the tool and keeps everything else.
fn resolve_collisions(
    inner: &mut Inner,
    pending: &BTreeMap<String, Arc<ToolEntry>>,
    domain: &str,
    original_name: &str,
) -> Option<String> {
    let taken =
        |inner: &Inner, name: &str| inner.flat.contains_key(name) || pending.contains_key(name);
    let prefixed = format!("{domain}_{original_name}");

    if inner.claimed.contains(original_name) {
        // A past collision claimed this bare name; prefix immediately.
        if !taken(inner, &prefixed) {
            return Some(prefixed);
        }
        if !taken(inner, original_name) {
            tracing::warn!(
                target: "toolgate::registry",
                domain,
                tool = original_name,
                "prefixed name already taken; keeping unprefixed name"
            );
            return Some(original_name.to_string());
        }
        tracing::warn!(
            target: "toolgate::registry",
            domain,
            tool = original_name,
            "unresolvable name collision; tool not registered"
        );
        return None;
    }

    if !taken(inner, original_name) {
        return Some(original_name.to_string());
    }

    // First collision on this name: the existing entry (from another
    // domain; our own slice was cleared before insertion) moves to its
    // prefixed form, and the bare name is claimed for good.
    inner.claimed.insert(original_name.to_string());
    if let Some(existing) = inner.flat.get(original_name).cloned() {
        let existing_prefixed = format!("{}_{}", existing.domain, existing.original_name);
        if taken(inner, &existing_prefixed) {
            tracing::warn!(
                target: "toolgate::registry",
                domain = %existing.domain,
                tool = %existing.original_name,
                "cannot prefix colliding tool; existing entry keeps its name"
            );
        } else {
            inner.flat.remove(original_name);
            let renamed = Arc::new(ToolEntry {
                name: existing_prefixed.clone(),
                ..(*existing).clone()
            });
            if let Some(slice) = inner.domains.get_mut(&existing.domain) {
                slice.tools.remove(original_name);
                slice
                    .tools
                    .insert(existing_prefixed.clone(), Arc::clone(&renamed));
            }
            inner.flat.insert(existing_prefixed, renamed);
            tracing::warn!(
                target: "toolgate::registry",
                tool = original_name,
                "tool name collision; both entries domain-prefixed"
            );
        }
    }

    if taken(inner, &prefixed) {
        tracing::warn!(
            target: "toolgate::registry",
            domain,
            tool = original_name,
            "unresolvable name collision; tool not registered"
        );
        return None;
    }
    Some(prefixed)
}

fn group_set(slice: &DomainSlice) -> Vec<String> {
    let groups: BTreeSet<String> = slice
        .tools
        .values()
        .filter_map(|entry| entry.group.clone())
        .collect();
    groups.into_iter().collect()
}
