//! Context injection for outbound prompts
//!
//! Assembles the conscious working-set block (once per session) and the
//! auto-retrieved block (every call) into a prefix the interceptor attaches
//! as a system message. Enforces the injected-context token budget and
//! deduplicates across blocks. The caller's message list is never mutated;
//! attachment always builds a new list.

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::storage::Store;
use crate::types::{MemoryHit, MemoryKind, MemoryRow, RuleRow};

/// Character-count approximation of one token
pub const APPROX_CHARS_PER_TOKEN: usize = 4;

/// Default injected-context budget in approximated tokens
pub const DEFAULT_TOKEN_BUDGET: usize = 800;

const CONSCIOUS_HEADER: &str = "Known context about this user:";
const AUTO_HEADER: &str = "Relevant prior context:";
const RULES_HEADER: &str = "Standing rules:";

#[derive(Debug, Clone)]
pub struct InjectorConfig {
    pub namespace: String,
    pub working_set_size: usize,
    pub token_budget: usize,
}

/// Estimate the token cost of a text by character count.
pub fn approx_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(APPROX_CHARS_PER_TOKEN)
}

/// Strip the promotion suffix from a working-set row id, recovering the
/// source long-term memory id.
fn promotion_source(memory_id: &str) -> &str {
    match memory_id.rfind("-ws-") {
        Some(idx) => &memory_id[..idx],
        None => memory_id,
    }
}

fn format_memory_entry(summary: &str, category: &str, created_at: chrono::DateTime<chrono::Utc>) -> String {
    format!(
        "- [{}] {} ({})",
        category,
        summary.trim(),
        created_at.format("%Y-%m-%d")
    )
}

/// Builds injected context blocks and tracks session priming.
pub struct ContextInjector {
    store: Store,
    config: InjectorConfig,
    primed: Mutex<bool>,
}

impl ContextInjector {
    pub fn new(store: Store, config: InjectorConfig) -> Self {
        Self {
            store,
            config,
            primed: Mutex::new(false),
        }
    }

    /// Forget the primed flag; the next call injects the conscious block
    /// again. Called on `enable`.
    pub fn reset_session(&self) {
        *self.primed.lock() = false;
    }

    pub fn is_primed(&self) -> bool {
        *self.primed.lock()
    }

    /// Assemble the context prefix for one outbound call.
    ///
    /// `auto_hits` come from the retrieval planner (empty when auto mode is
    /// off). When `conscious_enabled`, the first call of the session also
    /// carries the working set and active rules; the session is marked
    /// primed regardless of how much was found.
    pub fn build_block(&self, auto_hits: &[MemoryHit], conscious_enabled: bool) -> Option<String> {
        let mut conscious_rows: Vec<MemoryRow> = Vec::new();
        let mut rules: Vec<RuleRow> = Vec::new();

        if conscious_enabled {
            let mut primed = self.primed.lock();
            if !*primed {
                *primed = true;
                conscious_rows = self
                    .store
                    .working_set(&self.config.namespace, self.config.working_set_size)
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "working set read failed, priming without it");
                        Vec::new()
                    });
                rules = self
                    .store
                    .get_rules(&self.config.namespace, true)
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "rules read failed");
                        Vec::new()
                    });
            }
        }

        // the auto block omits anything the conscious block already carries
        let auto_entries: Vec<&MemoryHit> = auto_hits
            .iter()
            .filter(|hit| {
                !conscious_rows.iter().any(|row| {
                    row.memory_id == hit.memory_id
                        || promotion_source(&row.memory_id) == hit.memory_id
                })
            })
            .collect();

        if conscious_rows.is_empty() && rules.is_empty() && auto_entries.is_empty() {
            return None;
        }

        let block = self.render(&rules, &conscious_rows, &auto_entries);
        self.touch_injected(&conscious_rows, &auto_entries);
        Some(block)
    }

    /// Render within the token budget: lowest-ranked auto entries are
    /// dropped first, then the oldest conscious entries.
    fn render(
        &self,
        rules: &[RuleRow],
        conscious_rows: &[MemoryRow],
        auto_entries: &[&MemoryHit],
    ) -> String {
        let rule_lines: Vec<String> = rules
            .iter()
            .map(|rule| format!("- {}", rule.rule_text.trim()))
            .collect();
        // importance-descending, ties broken by recency (store order);
        // dropping from the tail sheds the oldest low-importance entries
        let mut conscious_lines: Vec<String> = conscious_rows
            .iter()
            .map(|row| {
                format_memory_entry(&row.summary, row.category_primary.as_str(), row.created_at)
            })
            .collect();
        let mut auto_lines: Vec<String> = auto_entries
            .iter()
            .map(|hit| {
                format_memory_entry(&hit.summary, hit.category_primary.as_str(), hit.created_at)
            })
            .collect();

        let budget = self.config.token_budget;
        let cost = |rules: &[String], conscious: &[String], auto: &[String]| {
            let mut total = 0;
            if !rules.is_empty() {
                total += approx_tokens(RULES_HEADER);
                total += rules.iter().map(|l| approx_tokens(l)).sum::<usize>();
            }
            if !conscious.is_empty() {
                total += approx_tokens(CONSCIOUS_HEADER);
                total += conscious.iter().map(|l| approx_tokens(l)).sum::<usize>();
            }
            if !auto.is_empty() {
                total += approx_tokens(AUTO_HEADER);
                total += auto.iter().map(|l| approx_tokens(l)).sum::<usize>();
            }
            total
        };

        while cost(&rule_lines, &conscious_lines, &auto_lines) > budget && !auto_lines.is_empty() {
            auto_lines.pop();
        }
        while cost(&rule_lines, &conscious_lines, &auto_lines) > budget
            && !conscious_lines.is_empty()
        {
            conscious_lines.pop();
        }

        let mut sections = Vec::new();
        if !rule_lines.is_empty() {
            sections.push(format!("{}\n{}", RULES_HEADER, rule_lines.join("\n")));
        }
        if !conscious_lines.is_empty() {
            sections.push(format!(
                "{}\n{}",
                CONSCIOUS_HEADER,
                conscious_lines.join("\n")
            ));
        }
        if !auto_lines.is_empty() {
            sections.push(format!("{}\n{}", AUTO_HEADER, auto_lines.join("\n")));
        }
        sections.join("\n\n")
    }

    /// Bump access tracking on everything that made it into the prompt.
    fn touch_injected(&self, conscious_rows: &[MemoryRow], auto_entries: &[&MemoryHit]) {
        for row in conscious_rows {
            if let Err(e) = self
                .store
                .touch_memory(MemoryKind::ShortTerm, &row.memory_id)
            {
                debug!(error = %e, memory_id = %row.memory_id, "touch failed");
            }
        }
        for hit in auto_entries {
            if let Err(e) = self.store.touch_memory(hit.memory_kind, &hit.memory_id) {
                debug!(error = %e, memory_id = %hit.memory_id, "touch failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::types::{MatchStrategy, MemoryCategory};

    fn injector(store: Store) -> ContextInjector {
        ContextInjector::new(
            store,
            InjectorConfig {
                namespace: "default".to_string(),
                working_set_size: 10,
                token_budget: DEFAULT_TOKEN_BUDGET,
            },
        )
    }

    fn hit(id: &str, summary: &str) -> MemoryHit {
        MemoryHit {
            memory_id: id.to_string(),
            memory_kind: MemoryKind::LongTerm,
            summary: summary.to_string(),
            category_primary: MemoryCategory::Fact,
            importance_score: 0.5,
            created_at: Utc::now(),
            final_score: 0.5,
            strategies: vec![MatchStrategy::FullText],
        }
    }

    #[test]
    fn empty_context_yields_none() {
        let injector = injector(Store::open_in_memory().unwrap());
        assert!(injector.build_block(&[], false).is_none());
    }

    #[test]
    fn priming_happens_once() {
        let injector = injector(Store::open_in_memory().unwrap());
        assert!(!injector.is_primed());
        let _ = injector.build_block(&[], true);
        assert!(injector.is_primed());

        injector.reset_session();
        assert!(!injector.is_primed());
    }

    #[test]
    fn auto_block_lists_hits_in_order() {
        let injector = injector(Store::open_in_memory().unwrap());
        let hits = vec![hit("m1", "Go project uses table-driven tests"), hit("m2", "Prefers pytest")];
        let block = injector.build_block(&hits, false).unwrap();

        assert!(block.starts_with(AUTO_HEADER));
        let first = block.find("Go project").unwrap();
        let second = block.find("Prefers pytest").unwrap();
        assert!(first < second);
    }

    #[test]
    fn budget_drops_auto_entries_first() {
        let store = Store::open_in_memory().unwrap();
        let injector = ContextInjector::new(
            store,
            InjectorConfig {
                namespace: "default".to_string(),
                working_set_size: 10,
                token_budget: 30,
            },
        );
        let hits: Vec<MemoryHit> = (0..20)
            .map(|i| hit(&format!("m{}", i), &format!("a fairly long memory summary number {}", i)))
            .collect();
        let block = injector.build_block(&hits, false).unwrap();
        assert!(approx_tokens(&block) <= 30 + approx_tokens(AUTO_HEADER));
        // highest-ranked entry survives
        assert!(block.contains("number 0"));
        assert!(!block.contains("number 19"));
    }

    #[test]
    fn promotion_source_strips_suffix() {
        assert_eq!(promotion_source("abc-ws-1710000000"), "abc");
        assert_eq!(promotion_source("plain-id"), "plain-id");
    }

    #[test]
    fn active_rules_ride_in_the_conscious_block() {
        use crate::types::{RuleRow, RuleType};

        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .put_rule(&RuleRow {
                rule_id: "r1".to_string(),
                rule_text: "Answer with code samples in Rust".to_string(),
                rule_type: RuleType::Instruction,
                priority: 8,
                active: true,
                context_conditions: None,
                namespace: "default".to_string(),
                created_at: now,
                updated_at: now,
            })
            .unwrap();
        store
            .put_rule(&RuleRow {
                rule_id: "r2".to_string(),
                rule_text: "Disabled rule".to_string(),
                rule_type: RuleType::Constraint,
                priority: 10,
                active: false,
                context_conditions: None,
                namespace: "default".to_string(),
                created_at: now,
                updated_at: now,
            })
            .unwrap();

        let injector = injector(store);
        let block = injector.build_block(&[], true).unwrap();
        assert!(block.contains("Standing rules:"));
        assert!(block.contains("code samples in Rust"));
        assert!(!block.contains("Disabled rule"));

        // rules belong to the one-shot conscious block
        assert!(injector.build_block(&[], true).is_none());
    }
}
