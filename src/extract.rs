// =============================================================================
// Selector Fallback — ordered, self-scoring extraction strategies
// =============================================================================
//
// Sites change their markup without notice. Every logical field therefore
// carries an ordered list of alternative selectors; the engine tries them in
// descending reliability order and keeps per-strategy success statistics so
// selectors that stop working sink down the list on their own.
//
//   reliability = success_rate * base_confidence * recency_factor
//   recency_factor = max(0.5, 1 - 0.1 * days_since_last_success)
//
// The score is never persisted, always recomputed. Extracted values pass a
// per-field validator before they count as a success.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::fetcher::{QueryRoot, SelectorKind};
use crate::metrics::MetricsRegistry;

/// Attribute names probed, in order, by attribute-kind strategies.
const ATTRIBUTE_PROBES: &[&str] = &["datetime", "title", "content", "value"];

/// Strategies attempted when extracting multiple values.
const MULTI_TOP_K: usize = 3;

// =============================================================================
// Fields and strategies
// =============================================================================

/// Logical fields the extractor knows how to locate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Title,
    Link,
    Company,
    Location,
    Description,
    Salary,
    Requirements,
    Benefits,
    Experience,
    WorkMode,
    PublishDate,
}

impl Field {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Title => "job_title",
            Self::Link => "job_link",
            Self::Company => "company",
            Self::Location => "location",
            Self::Description => "description",
            Self::Salary => "salary",
            Self::Requirements => "requirements",
            Self::Benefits => "benefits",
            Self::Experience => "experience",
            Self::WorkMode => "work_mode",
            Self::PublishDate => "publish_date",
        }
    }
}

/// One selector alternative with its success history.
#[derive(Debug, Clone)]
pub struct SelectorStrategy {
    pub selector: String,
    pub kind: SelectorKind,
    /// Static confidence assigned when the strategy was authored, in [0, 1].
    pub base_confidence: f64,
    pub success_count: u64,
    pub fail_count: u64,
    pub last_success: Option<DateTime<Utc>>,
}

impl SelectorStrategy {
    fn new(selector: &str, kind: SelectorKind, base_confidence: f64) -> Self {
        Self {
            selector: selector.to_string(),
            kind,
            base_confidence,
            success_count: 0,
            fail_count: 0,
            last_success: None,
        }
    }

    /// Dynamic priority of this strategy.
    pub fn reliability_score(&self, now: DateTime<Utc>) -> f64 {
        let total = self.success_count + self.fail_count;
        if total == 0 {
            return self.base_confidence;
        }
        let success_rate = self.success_count as f64 / total as f64;
        let recency = match self.last_success {
            Some(last) => {
                let days = (now - last).num_days() as f64;
                (1.0 - 0.1 * days).max(0.5)
            }
            None => 1.0,
        };
        success_rate * recency * self.base_confidence
    }
}

// =============================================================================
// Validators
// =============================================================================

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Per-field acceptance rule applied to every candidate value.
fn validate(field: Field, value: &str) -> bool {
    let trimmed = value.trim();
    let lower = trimmed.to_lowercase();
    match field {
        Field::Title => trimmed.len() > 5,
        Field::Link => trimmed.contains("/vagas/") || trimmed.starts_with('/'),
        Field::Company => trimmed.len() > 2 && trimmed != "Não informada",
        Field::Location => trimmed.len() > 2,
        Field::Description => trimmed.len() > 20,
        Field::Salary => {
            trimmed.contains("R$") || lower.contains("combinar") || lower.contains("competitive")
        }
        Field::Requirements => trimmed.len() > 10,
        Field::Benefits => trimmed.len() > 5,
        Field::Experience => contains_any(
            &lower,
            &["júnior", "junior", "pleno", "sênior", "senior", "anos", "experiência"],
        ),
        Field::WorkMode => contains_any(
            &lower,
            &["home", "remoto", "presencial", "híbrido", "hibrido", "office"],
        ),
        Field::PublishDate => contains_any(
            &lower,
            &["dia", "publicada", "há", "ontem", "hoje", "/", "-"],
        ),
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Fallback extraction engine with self-adjusting strategy order.
pub struct SelectorEngine {
    groups: Mutex<HashMap<Field, Vec<SelectorStrategy>>>,
    metrics: Arc<MetricsRegistry>,
}

impl SelectorEngine {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            groups: Mutex::new(default_strategies()),
            metrics,
        }
    }

    /// Extract one value for `field` from `root`, trying strategies in
    /// descending reliability order. Returns `None` when every strategy
    /// fails or validates negative, which is acceptable for optional fields.
    pub async fn extract<R>(&self, root: &R, field: Field) -> Option<String>
    where
        R: QueryRoot + ?Sized,
    {
        let ordered = self.ordered_snapshot(field);

        for (depth, strategy) in ordered.iter().enumerate() {
            self.metrics.increment_counter("fallback.selector_attempts", 1);

            let value = self.attempt(root, strategy).await;
            match value {
                Some(value) if validate(field, &value) => {
                    self.record_outcome(field, &strategy.selector, true);
                    self.metrics
                        .increment_counter("fallback.selector_successes", 1);
                    self.metrics
                        .record("fallback.fallback_level", depth as f64, None);
                    return Some(value.trim().to_string());
                }
                _ => self.record_outcome(field, &strategy.selector, false),
            }
        }

        debug!(field = field.name(), "all selector strategies failed");
        None
    }

    /// Extract every matching value for `field`, limited to the top
    /// strategies. The first strategy yielding any valid value wins.
    pub async fn extract_multiple<R>(&self, root: &R, field: Field) -> Vec<String>
    where
        R: QueryRoot + ?Sized,
    {
        let ordered = self.ordered_snapshot(field);

        for strategy in ordered.iter().take(MULTI_TOP_K) {
            self.metrics.increment_counter("fallback.selector_attempts", 1);

            let elements = match root.query(&strategy.selector, strategy.kind).await {
                Ok(elements) => elements,
                Err(_) => {
                    self.record_outcome(field, &strategy.selector, false);
                    continue;
                }
            };

            let mut values = Vec::new();
            for element in &elements {
                if let Ok(text) = element.text().await {
                    if validate(field, &text) {
                        values.push(text.trim().to_string());
                    }
                }
            }

            if !values.is_empty() {
                self.record_outcome(field, &strategy.selector, true);
                self.metrics
                    .increment_counter("fallback.selector_successes", 1);
                return values;
            }
            self.record_outcome(field, &strategy.selector, false);
        }

        Vec::new()
    }

    async fn attempt<R>(&self, root: &R, strategy: &SelectorStrategy) -> Option<String>
    where
        R: QueryRoot + ?Sized,
    {
        let elements = root.query(&strategy.selector, strategy.kind).await.ok()?;
        let element = elements.first()?;

        match strategy.kind {
            SelectorKind::Css | SelectorKind::Xpath | SelectorKind::Text => {
                element.text().await.ok().filter(|t| !t.is_empty())
            }
            SelectorKind::Attribute => {
                for attr in ATTRIBUTE_PROBES {
                    if let Ok(Some(value)) = element.attribute(attr).await {
                        if !value.is_empty() {
                            return Some(value);
                        }
                    }
                }
                None
            }
        }
    }

    /// Strategies for `field`, sorted by current reliability, best first.
    fn ordered_snapshot(&self, field: Field) -> Vec<SelectorStrategy> {
        let now = Utc::now();
        let groups = self.groups.lock();
        let mut ordered: Vec<SelectorStrategy> =
            groups.get(&field).cloned().unwrap_or_default();
        ordered.sort_by(|a, b| {
            b.reliability_score(now)
                .partial_cmp(&a.reliability_score(now))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ordered
    }

    fn record_outcome(&self, field: Field, selector: &str, success: bool) {
        let mut groups = self.groups.lock();
        if let Some(strategies) = groups.get_mut(&field) {
            if let Some(strategy) = strategies.iter_mut().find(|s| s.selector == selector) {
                if success {
                    strategy.success_count += 1;
                    strategy.last_success = Some(Utc::now());
                } else {
                    strategy.fail_count += 1;
                }
            }
        }
    }

    /// Current per-field success totals, for the session summary.
    pub fn stats(&self) -> HashMap<&'static str, (u64, u64)> {
        let groups = self.groups.lock();
        groups
            .iter()
            .map(|(field, strategies)| {
                let successes: u64 = strategies.iter().map(|s| s.success_count).sum();
                let failures: u64 = strategies.iter().map(|s| s.fail_count).sum();
                (field.name(), (successes, failures))
            })
            .collect()
    }
}

/// The authored strategy tables. Selectors target the job-board markup the
/// engine was built against, with progressively looser fallbacks.
fn default_strategies() -> HashMap<Field, Vec<SelectorStrategy>> {
    use SelectorKind::{Attribute, Css, Text, Xpath};
    let s = SelectorStrategy::new;

    HashMap::from([
        (
            Field::Title,
            vec![
                s(r#"h2 a[href*="/vagas/"]"#, Css, 0.9),
                s(r#"[data-testid="job-title"]"#, Css, 0.85),
                s("h1.job-title", Css, 0.8),
                s(r#"//h2/a[contains(@href, "/vagas/")]"#, Xpath, 0.7),
                s(".vaga-title a", Css, 0.6),
                s(r#"[class*="title"] a[href*="vagas"]"#, Css, 0.5),
            ],
        ),
        (
            Field::Link,
            vec![
                s(r#"h2 a[href*="/vagas/"]"#, Css, 0.9),
                s(r#"[data-testid="job-link"]"#, Css, 0.85),
                s(r#"a[href*="/vagas/"][href*="/"]"#, Css, 0.8),
                s(".job-link", Css, 0.7),
                s(r#"//a[contains(@href, "/vagas/")]"#, Xpath, 0.6),
            ],
        ),
        (
            Field::Company,
            vec![
                s(r#"[data-testid="company-name"]"#, Css, 0.9),
                s("span.sc-gEvEer", Css, 0.8),
                s(r#"[class*="company"]"#, Css, 0.7),
                s(r#"[class*="empresa"]"#, Css, 0.7),
                s(".job-company", Css, 0.6),
                s(r#"//span[contains(@class, "company")]"#, Xpath, 0.5),
                s(r#"span:has-text("Ltda")"#, Text, 0.4),
            ],
        ),
        (
            Field::Location,
            vec![
                s(r#"[data-testid="job-location"]"#, Css, 0.9),
                s(r#"button[title*="Local"]"#, Css, 0.8),
                s(r#"span:has-text("Home Office")"#, Text, 0.8),
                s(r#"[class*="location"]"#, Css, 0.7),
                s(r#"[class*="local"]"#, Css, 0.7),
                s(".job-location", Css, 0.6),
                s(r#"[class*="cidade"]"#, Css, 0.5),
            ],
        ),
        (
            Field::Description,
            vec![
                s(r#"[data-testid="job-description"]"#, Css, 0.9),
                s(".job-description", Css, 0.8),
                s(r#"[class*="description"]"#, Css, 0.7),
                s(r#"[class*="descricao"]"#, Css, 0.6),
                s(r#"section:has-text("Descrição")"#, Text, 0.6),
                s(r#"//section[contains(., "Descrição")]"#, Xpath, 0.4),
            ],
        ),
        (
            Field::Salary,
            vec![
                s(r#"[data-testid="salary"]"#, Css, 0.9),
                s(r#"[data-testid="job-salary"]"#, Css, 0.9),
                s(r#"span:has-text("R$")"#, Text, 0.8),
                s(".salary", Css, 0.8),
                s(r#"[class*="salario"]"#, Css, 0.7),
                s(r#"[class*="remuneracao"]"#, Css, 0.6),
                s(r#"//span[contains(text(), "R$")]"#, Xpath, 0.6),
            ],
        ),
        (
            Field::Requirements,
            vec![
                s(r#"[data-testid="job-requirements"]"#, Css, 0.9),
                s(r#"section:has-text("Requisitos")"#, Text, 0.7),
                s(r#"[class*="requirements"]"#, Css, 0.7),
                s(r#"[class*="requisitos"]"#, Css, 0.7),
                s(r#"section:has-text("Qualificações")"#, Text, 0.6),
                s(".job-requirements", Css, 0.6),
            ],
        ),
        (
            Field::Benefits,
            vec![
                s(r#"[data-testid="job-benefits"]"#, Css, 0.9),
                s(r#"section:has-text("Benefícios")"#, Text, 0.7),
                s(r#"[class*="benefits"]"#, Css, 0.7),
                s(r#"[class*="beneficios"]"#, Css, 0.7),
                s(r#"section:has-text("Oferecemos")"#, Text, 0.6),
                s(".job-benefits", Css, 0.6),
            ],
        ),
        (
            Field::Experience,
            vec![
                s(r#"[data-testid="experience-level"]"#, Css, 0.9),
                s(r#"[class*="experience"]"#, Css, 0.7),
                s(r#"span:has-text("Júnior")"#, Text, 0.6),
                s(r#"span:has-text("Pleno")"#, Text, 0.6),
                s(r#"span:has-text("Sênior")"#, Text, 0.6),
                s(r#"[class*="nivel"]"#, Css, 0.6),
                s(r#"span:has-text("anos")"#, Text, 0.5),
            ],
        ),
        (
            Field::WorkMode,
            vec![
                s(r#"[data-testid="work-mode"]"#, Css, 0.9),
                s(r#"span:has-text("Home Office")"#, Text, 0.8),
                s(r#"span:has-text("Remoto")"#, Text, 0.8),
                s(r#"span:has-text("Presencial")"#, Text, 0.7),
                s(r#"span:has-text("Híbrido")"#, Text, 0.7),
                s(r#"[class*="modalidade"]"#, Css, 0.7),
            ],
        ),
        (
            Field::PublishDate,
            vec![
                s(r#"[data-testid="publish-date"]"#, Css, 0.9),
                s("time", Css, 0.8),
                s(r#"[class*="publicada"]"#, Css, 0.7),
                s(r#"[class*="date"]"#, Css, 0.7),
                s("[datetime]", Attribute, 0.6),
                s(r#"span:has-text("publicada")"#, Text, 0.5),
            ],
        ),
    ])
}
