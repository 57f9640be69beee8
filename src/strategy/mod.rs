//! Strategy resolver: turns a natural-language instruction into an element
//! interaction by cascading through cached, structural and perceptual tiers,
//! and feeds every outcome back into session memory.

pub mod fsm;
pub mod perceptual;
pub mod structural;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::browser::{DriverError, ElementAction, Locator, PageDriver};
use crate::memory::{instruction_hash, PageContext, SessionMemory};
use crate::storage::StoreError;
use fsm::{transition, ResolverState, TierOutcome};

/// Which strategy produced a step's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyTier {
    /// No element lookup needed (navigate, verify).
    Direct,
    Cached,
    Structural,
    Perceptual,
}

impl std::fmt::Display for StrategyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StrategyTier::Direct => "direct",
            StrategyTier::Cached => "cached",
            StrategyTier::Structural => "structural",
            StrategyTier::Perceptual => "perceptual",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Instruction parsing
// ---------------------------------------------------------------------------

const ACTION_VERBS: &[&str] = &[
    "click", "fill", "enter", "type", "select", "choose", "press", "tap",
];
const ARTICLES: &[&str] = &["the", "a", "an"];
const ELEMENT_NOUNS: &[&str] = &["button", "link", "field", "input", "textbox", "box"];

/// Kind of element an instruction refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementHint {
    Button,
    Link,
    TextInput,
    Any,
}

/// What an instruction asks for, stripped of phrasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub instruction: String,
    /// Visible text or accessible name of the target element, lowercase.
    pub target: String,
    pub hint: ElementHint,
    pub selector_hint: Option<String>,
}

fn quoted_segment(instruction: &str) -> Option<&str> {
    for (open, close) in [('"', '"'), ('\'', '\''), ('\u{201c}', '\u{201d}')] {
        let mut from = 0;
        while let Some(offset) = instruction[from..].find(open) {
            let start = from + offset;
            let inner_start = start + open.len_utf8();
            from = inner_start;
            // An apostrophe inside a word ("user's") never opens a quote.
            if open == '\'' && !word_boundary(instruction[..start].chars().next_back()) {
                continue;
            }
            if let Some(end) = closing_quote(&instruction[inner_start..], close) {
                let inner = instruction[inner_start..inner_start + end].trim();
                if !inner.is_empty() {
                    return Some(inner);
                }
            }
        }
    }
    None
}

fn word_boundary(neighbour: Option<char>) -> bool {
    neighbour.map_or(true, |c| !c.is_alphanumeric())
}

/// Byte offset of the first `close` in `rest` that ends a quoted segment.
fn closing_quote(rest: &str, close: char) -> Option<usize> {
    let mut from = 0;
    while let Some(offset) = rest[from..].find(close) {
        let end = from + offset;
        let after = rest[end + close.len_utf8()..].chars().next();
        if close != '\'' || word_boundary(after) {
            return Some(end);
        }
        from = end + close.len_utf8();
    }
    None
}

impl Intent {
    pub fn parse(instruction: &str, selector_hint: Option<&str>) -> Self {
        let lower = instruction.to_lowercase();
        let hint = if lower.contains("button") {
            ElementHint::Button
        } else if lower.contains("input") || lower.contains("field") || lower.contains("textbox") {
            ElementHint::TextInput
        } else if lower.contains("link") {
            ElementHint::Link
        } else {
            ElementHint::Any
        };

        let target = match quoted_segment(instruction) {
            Some(quoted) => quoted.to_lowercase(),
            None => lower
                .split_whitespace()
                .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
                .filter(|w| {
                    !w.is_empty()
                        && !ACTION_VERBS.contains(w)
                        && !ARTICLES.contains(w)
                        && !ELEMENT_NOUNS.contains(w)
                })
                .collect::<Vec<_>>()
                .join(" "),
        };

        Self {
            instruction: instruction.to_string(),
            target,
            hint,
            selector_hint: selector_hint
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Text similarity in [0, 1]: 1.0 for equal token sets, at least 0.6 when
/// `candidate` contains every token of `target`, token Jaccard otherwise.
pub fn similarity(target: &str, candidate: &str) -> f64 {
    let wanted = tokens(target);
    let have = tokens(candidate);
    if wanted.is_empty() || have.is_empty() {
        return 0.0;
    }
    if wanted == have {
        return 1.0;
    }

    let shared = wanted.intersection(&have).count() as f64;
    let jaccard = shared / wanted.union(&have).count() as f64;
    if wanted.is_subset(&have) {
        jaccard.max(0.6)
    } else {
        jaccard
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("browser failure while resolving: {0}")]
    Driver(#[from] DriverError),

    #[error("session memory unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Tuning for the cascade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolverSettings {
    /// Cached entries at or below this reliability are not attempted.
    pub reliability_floor: f64,
    /// Structural candidates attempted per instruction.
    pub structural_candidates: usize,
    /// Cost charged per perceptual invocation.
    pub perceptual_cost_usd: f64,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            reliability_floor: 0.3,
            structural_candidates: 3,
            perceptual_cost_usd: 0.002,
        }
    }
}

/// Outcome of resolving one instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// `None` when every tier was exhausted.
    pub tier: Option<StrategyTier>,
    pub locator: Option<Locator>,
    /// Interactions actually attempted.
    pub attempts: u32,
    /// Resolved only after an earlier attempted tier failed.
    pub self_healed: bool,
    /// Structural and perceptual tier invocations.
    pub strategy_invocations: u32,
    pub cost_usd: f64,
    pub errors: Vec<String>,
    pub trail: Vec<ResolverState>,
}

impl Resolution {
    pub fn resolved(&self) -> bool {
        self.tier.is_some()
    }
}

/// Per-instruction working state carried across tiers.
struct Attempt<'a> {
    intent: &'a Intent,
    action: &'a ElementAction,
    ctx: PageContext,
    hash: String,
    resolution: Resolution,
    earlier_failure: bool,
}

#[derive(Clone)]
pub struct Resolver {
    memory: SessionMemory,
    settings: ResolverSettings,
}

impl Resolver {
    pub fn new(memory: SessionMemory, settings: ResolverSettings) -> Self {
        Self { memory, settings }
    }

    pub fn memory(&self) -> &SessionMemory {
        &self.memory
    }

    /// Run the cascade for one instruction on the current page.
    pub async fn resolve(
        &self,
        driver: &mut dyn PageDriver,
        intent: &Intent,
        action: &ElementAction,
    ) -> Result<Resolution, ResolveError> {
        let url = driver.current_url().await?;
        let ctx = PageContext::new(&url, action.kind());
        let hash = instruction_hash(&intent.instruction, &ctx);

        let mut attempt = Attempt {
            intent,
            action,
            ctx,
            hash,
            resolution: Resolution {
                tier: None,
                locator: None,
                attempts: 0,
                self_healed: false,
                strategy_invocations: 0,
                cost_usd: 0.0,
                errors: Vec::new(),
                trail: vec![ResolverState::Start],
            },
            earlier_failure: false,
        };

        let mut state = ResolverState::Start;
        while !state.is_terminal() {
            let outcome = match state {
                ResolverState::Start => TierOutcome::Skipped,
                ResolverState::TryCached => self.try_cached(driver, &mut attempt).await?,
                ResolverState::TryStructural => self.try_structural(driver, &mut attempt).await?,
                ResolverState::TryPerceptual => self.try_perceptual(driver, &mut attempt).await?,
                ResolverState::Resolved(_) | ResolverState::Exhausted => break,
            };
            if outcome == TierOutcome::Failed {
                attempt.earlier_failure = true;
            }
            state = transition(state, outcome);
            attempt.resolution.trail.push(state);
        }

        let mut resolution = attempt.resolution;
        if let ResolverState::Resolved(tier) = state {
            resolution.tier = Some(tier);
        }
        debug!(
            instruction = %intent.instruction,
            tier = ?resolution.tier,
            attempts = resolution.attempts,
            "instruction resolved"
        );
        Ok(resolution)
    }

    /// Perform `locator`; interaction misses are tier failures, session loss is not.
    async fn perform(
        driver: &mut dyn PageDriver,
        attempt: &mut Attempt<'_>,
        locator: &Locator,
        tier: StrategyTier,
    ) -> Result<bool, ResolveError> {
        attempt.resolution.attempts += 1;
        match driver.perform(locator, attempt.action).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_infrastructure() => Err(e.into()),
            Err(e) => {
                debug!(%locator, %tier, error = %e, "strategy attempt missed");
                attempt.resolution.errors.push(format!("{tier}: {e}"));
                Ok(false)
            }
        }
    }

    async fn succeed(
        &self,
        attempt: &mut Attempt<'_>,
        locator: Locator,
    ) -> Result<TierOutcome, ResolveError> {
        self.memory
            .record_success(&attempt.hash, &attempt.ctx.url, &attempt.intent.instruction, &locator)
            .await?;
        attempt.resolution.locator = Some(locator);
        Ok(TierOutcome::Succeeded)
    }

    async fn try_cached(
        &self,
        driver: &mut dyn PageDriver,
        attempt: &mut Attempt<'_>,
    ) -> Result<TierOutcome, ResolveError> {
        let Some(entry) = self.memory.lookup(&attempt.hash).await? else {
            return Ok(TierOutcome::Skipped);
        };
        if entry.reliability_score <= self.settings.reliability_floor {
            debug!(
                hash = %attempt.hash,
                score = entry.reliability_score,
                "cached strategy below reliability floor"
            );
            return Ok(TierOutcome::Skipped);
        }

        if Self::perform(driver, attempt, &entry.action_data, StrategyTier::Cached).await? {
            self.succeed(attempt, entry.action_data).await
        } else {
            self.memory.record_failure(&attempt.hash).await?;
            Ok(TierOutcome::Failed)
        }
    }

    async fn try_structural(
        &self,
        driver: &mut dyn PageDriver,
        attempt: &mut Attempt<'_>,
    ) -> Result<TierOutcome, ResolveError> {
        if attempt.intent.target.is_empty() && attempt.intent.selector_hint.is_none() {
            return Ok(TierOutcome::Skipped);
        }
        attempt.resolution.strategy_invocations += 1;

        let nodes = match driver.dom_snapshot().await {
            Ok(nodes) => nodes,
            Err(e) if e.is_infrastructure() => return Err(e.into()),
            Err(e) => {
                attempt.resolution.errors.push(format!("structural: {e}"));
                return Ok(TierOutcome::Failed);
            }
        };
        let candidates = structural::rank_candidates(
            attempt.intent,
            attempt.action,
            &nodes,
            self.settings.structural_candidates,
        );
        if candidates.is_empty() {
            attempt
                .resolution
                .errors
                .push(format!("structural: no element matches '{}'", attempt.intent.target));
            return Ok(TierOutcome::Failed);
        }

        for candidate in candidates {
            if Self::perform(driver, attempt, &candidate.locator, StrategyTier::Structural).await? {
                if attempt.earlier_failure {
                    attempt.resolution.self_healed = true;
                    info!(locator = %candidate.locator, "self-healed via structural search");
                }
                return self.succeed(attempt, candidate.locator).await;
            }
        }
        Ok(TierOutcome::Failed)
    }

    async fn try_perceptual(
        &self,
        driver: &mut dyn PageDriver,
        attempt: &mut Attempt<'_>,
    ) -> Result<TierOutcome, ResolveError> {
        if attempt.intent.target.is_empty() {
            return Ok(TierOutcome::Skipped);
        }
        attempt.resolution.strategy_invocations += 1;
        attempt.resolution.cost_usd += self.settings.perceptual_cost_usd;

        let regions = match driver.visual_regions().await {
            Ok(regions) => regions,
            Err(e) if e.is_infrastructure() => return Err(e.into()),
            Err(e) => {
                attempt.resolution.errors.push(format!("perceptual: {e}"));
                return Ok(TierOutcome::Failed);
            }
        };
        let Some(locator) = perceptual::locate(&attempt.intent.target, &regions) else {
            attempt
                .resolution
                .errors
                .push(format!("perceptual: no rendered text matches '{}'", attempt.intent.target));
            return Ok(TierOutcome::Failed);
        };

        if Self::perform(driver, attempt, &locator, StrategyTier::Perceptual).await? {
            attempt.resolution.self_healed = true;
            info!(%locator, "self-healed via perceptual search");
            self.succeed(attempt, locator).await
        } else {
            Ok(TierOutcome::Failed)
        }
    }
}
