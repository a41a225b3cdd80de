//! Document type classification.
//!
//! [`PatternClassifier`] scores text against a declarative [`RuleTable`]
//! without any external call. [`DocumentClassifier`] runs it first and only
//! escalates low-confidence results to the model service, through the
//! [`CallSerializer`], falling back to the pattern result on any model error.

use crate::error::{ModelError, PipelineError};
use crate::models::{Classification, ClassificationSource, DocumentType};
use crate::serializer::CallSerializer;
use crate::traits::ModelService;
use regex::{Regex, RegexBuilder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pattern results at or above this confidence are final.
pub const MODEL_ESCALATION_THRESHOLD: f64 = 0.7;

const HEAD_SHORT: usize = 500;
const HEAD_LONG: usize = 2_000;

/// Portion of the lower-cased text a rule looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Head(usize),
    Full,
}

#[derive(Debug, Clone)]
struct Condition {
    window: Window,
    pattern: Regex,
}

impl Condition {
    fn holds(&self, text: &LoweredText<'_>) -> bool {
        self.pattern.is_match(text.window(self.window))
    }
}

/// A weighted pattern. It scores when `pattern` matches its window, every
/// `requires` condition holds and no `unless` condition holds.
#[derive(Debug, Clone)]
pub struct PatternRule {
    primary: Condition,
    requires: Vec<Condition>,
    unless: Vec<Condition>,
    weight: i32,
}

impl PatternRule {
    pub fn new(window: Window, pattern: &str, weight: i32) -> Result<Self, regex::Error> {
        Ok(Self {
            primary: condition(window, pattern)?,
            requires: Vec::new(),
            unless: Vec::new(),
            weight,
        })
    }

    pub fn requires(mut self, window: Window, pattern: &str) -> Result<Self, regex::Error> {
        self.requires.push(condition(window, pattern)?);
        Ok(self)
    }

    pub fn unless(mut self, window: Window, pattern: &str) -> Result<Self, regex::Error> {
        self.unless.push(condition(window, pattern)?);
        Ok(self)
    }

    fn score(&self, text: &LoweredText<'_>) -> i32 {
        let fires = self.primary.holds(text)
            && self.requires.iter().all(|condition| condition.holds(text))
            && !self.unless.iter().any(|condition| condition.holds(text));
        if fires {
            self.weight
        } else {
            0
        }
    }
}

#[derive(Debug, Clone)]
pub struct TypeRules {
    pub document_type: DocumentType,
    pub rules: Vec<PatternRule>,
}

/// Cross-type adjustment applied after scoring, in table order, to separate
/// structurally similar documents.
#[derive(Debug, Clone)]
pub struct ExclusionRule {
    min_score: Option<(DocumentType, i32)>,
    conditions: Vec<Condition>,
    adjustments: Vec<(DocumentType, i32)>,
}

impl ExclusionRule {
    pub fn when_score(document_type: DocumentType, at_least: i32) -> Self {
        Self {
            min_score: Some((document_type, at_least)),
            conditions: Vec::new(),
            adjustments: Vec::new(),
        }
    }

    pub fn when_matches(window: Window, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            min_score: None,
            conditions: vec![condition(window, pattern)?],
            adjustments: Vec::new(),
        })
    }

    pub fn and_matches(mut self, window: Window, pattern: &str) -> Result<Self, regex::Error> {
        self.conditions.push(condition(window, pattern)?);
        Ok(self)
    }

    pub fn adjust(mut self, document_type: DocumentType, delta: i32) -> Self {
        self.adjustments.push((document_type, delta));
        self
    }

    fn apply(&self, scores: &mut Scores, text: &LoweredText<'_>) {
        if let Some((document_type, at_least)) = self.min_score {
            if scores.get(document_type) < at_least {
                return;
            }
        }
        if !self.conditions.iter().all(|condition| condition.holds(text)) {
            return;
        }
        for (document_type, delta) in &self.adjustments {
            scores.add(*document_type, *delta);
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuleTable {
    /// Administrative documents (minutes, bylaws, notices) short-circuit to
    /// [`DocumentType::Other`] before any scoring.
    pub administrative: Vec<(Window, Regex)>,
    pub types: Vec<TypeRules>,
    pub exclusions: Vec<ExclusionRule>,
    /// The best score must be strictly greater than this to name a type.
    pub min_score: i32,
    pub normalizer: f64,
    pub max_confidence: f64,
    pub administrative_confidence: f64,
}

impl RuleTable {
    /// Rules for Brazilian court and office documents.
    pub fn legal_defaults() -> Result<Self, regex::Error> {
        use DocumentType::*;
        use Window::{Full, Head};

        let administrative = [
            r"ata\s+(de\s+)?assembl(e|é)ia",
            r"assembl(e|é)ia\s+geral",
            r"edital",
            r"portaria",
            r"regulamento",
            r"estatuto\s+social",
        ]
        .iter()
        .map(|pattern| Ok((Head(HEAD_LONG), compile(pattern)?)))
        .collect::<Result<Vec<_>, regex::Error>>()?;

        let types = vec![
            TypeRules {
                document_type: InitialPetition,
                rules: vec![
                    PatternRule::new(Head(HEAD_LONG), r"peti[çc][ãa]o\s+inicial", 20)?,
                    PatternRule::new(Head(HEAD_SHORT), r"exmo.*juiz", 12)?.requires(Full, r"requer")?,
                    PatternRule::new(Head(HEAD_LONG), r"vem\s+respeitosamente", 10)?,
                    PatternRule::new(Full, r"dos\s+fatos", 8)?.requires(Full, r"dos\s+pedidos")?,
                ],
            },
            TypeRules {
                document_type: Defense,
                rules: vec![
                    PatternRule::new(Head(HEAD_LONG), r"contesta[çc][ãa]o", 20)?,
                    PatternRule::new(Full, r"impugna[çc][ãa]o", 12)?,
                    PatternRule::new(Full, r"r[ée]u", 10)?.requires(Full, r"improcedente")?,
                    PatternRule::new(Full, r"n[ãa]o\s+procede", 5)?,
                ],
            },
            TypeRules {
                document_type: Judgment,
                rules: vec![
                    PatternRule::new(Full, r"senten[çc]a", 18)?,
                    PatternRule::new(Full, r"julgo\s+(procedente|improcedente)", 15)?,
                    PatternRule::new(Full, r"dispositivo.*julgo", 8)?,
                    PatternRule::new(Full, r"ante\s+o\s+exposto", 5)?,
                ],
            },
            TypeRules {
                document_type: AppellateDecision,
                rules: vec![
                    PatternRule::new(Full, r"ac[óo]rd[ãa]o", 20)?,
                    PatternRule::new(Full, r"desembargador", 15)?,
                    PatternRule::new(Full, r"tribunal", 8)?,
                    PatternRule::new(Full, r"vistos,?\s+relatados", 10)?,
                ],
            },
            TypeRules {
                document_type: CourtOrder,
                rules: vec![
                    PatternRule::new(Head(HEAD_LONG), r"despacho", 20)?,
                    PatternRule::new(Full, r"(defiro|indefiro)", 12)?,
                    PatternRule::new(Full, r"(intime-se|intimem-se|cumpra-se)", 10)?,
                ],
            },
            TypeRules {
                document_type: LegalOpinion,
                rules: vec![
                    PatternRule::new(Head(HEAD_SHORT), r"parecer\s+jur[ií]dico", 30)?,
                    PatternRule::new(Head(HEAD_LONG), r"parecer", 20)?
                        .unless(Head(HEAD_SHORT), r"parecer\s+jur[ií]dico")?,
                    PatternRule::new(Full, r"opini[ãa]o\s+jur[ií]dica", 12)?,
                    PatternRule::new(Full, r"(entende-se|conclui-se|opina-se)\s+que", 10)?,
                    PatternRule::new(Full, r"an[áa]lise\s+jur[ií]dica", 8)?,
                ],
            },
            TypeRules {
                document_type: Contract,
                rules: vec![
                    PatternRule::new(Head(HEAD_LONG), r"contrato", 20)?,
                    PatternRule::new(Full, r"cl[áa]usula", 15)?.requires(Full, r"contratante")?,
                    PatternRule::new(Full, r"partes\s+contratantes", 12)?,
                    PatternRule::new(Full, r"contratado", 10)?.requires(Full, r"contratante")?,
                ],
            },
            TypeRules {
                document_type: PowerOfAttorney,
                rules: vec![
                    PatternRule::new(Head(HEAD_LONG), r"procura[çc][ãa]o", 20)?,
                    PatternRule::new(Full, r"poderes\s+para", 15)?,
                    PatternRule::new(Full, r"outorgante", 12)?.requires(Full, r"outorgado")?,
                    PatternRule::new(Full, r"constitui.*advogado", 10)?,
                ],
            },
            TypeRules {
                document_type: PersonalDocument,
                rules: vec![
                    PatternRule::new(Full, r"certid[ãa]o", 18)?,
                    PatternRule::new(Full, r"\b(rg|cpf)\b", 15)?,
                    PatternRule::new(Full, r"carteira\s+de\s+identidade", 12)?,
                    PatternRule::new(Full, r"registro\s+geral", 10)?,
                ],
            },
        ];

        let exclusions = vec![
            ExclusionRule::when_score(LegalOpinion, 20)
                .adjust(Judgment, -15)
                .adjust(CourtOrder, -15)
                .adjust(AppellateDecision, -10),
            ExclusionRule::when_score(Judgment, 18)
                .and_matches(Full, r"julgo")?
                .adjust(LegalOpinion, -12),
            ExclusionRule::when_matches(Head(HEAD_SHORT), r"parecer")?
                .and_matches(Full, r"julgo\s+(procedente|improcedente)")?
                .adjust(LegalOpinion, -20)
                .adjust(Judgment, 10),
            ExclusionRule::when_score(AppellateDecision, 20).adjust(Judgment, -10),
            ExclusionRule::when_score(Contract, 20).adjust(PowerOfAttorney, -15),
        ];

        Ok(Self {
            administrative,
            types,
            exclusions,
            min_score: 10,
            normalizer: 25.0,
            max_confidence: 0.98,
            administrative_confidence: 0.90,
        })
    }
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

fn condition(window: Window, pattern: &str) -> Result<Condition, regex::Error> {
    Ok(Condition {
        window,
        pattern: compile(pattern)?,
    })
}

/// Returns at most the first `chars` characters of `text`.
pub(crate) fn head(text: &str, chars: usize) -> &str {
    match text.char_indices().nth(chars) {
        Some((offset, _)) => &text[..offset],
        None => text,
    }
}

struct LoweredText<'a> {
    full: &'a str,
}

impl<'a> LoweredText<'a> {
    fn window(&self, window: Window) -> &'a str {
        match window {
            Window::Head(chars) => head(self.full, chars),
            Window::Full => self.full,
        }
    }
}

/// Per-type score sheet, kept in rule-table order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scores(Vec<(DocumentType, i32)>);

impl Scores {
    pub fn get(&self, document_type: DocumentType) -> i32 {
        self.0
            .iter()
            .find(|(kind, _)| *kind == document_type)
            .map(|(_, score)| *score)
            .unwrap_or(0)
    }

    fn add(&mut self, document_type: DocumentType, delta: i32) {
        if let Some(entry) = self.0.iter_mut().find(|(kind, _)| *kind == document_type) {
            entry.1 += delta;
        }
    }

    /// Highest positive score; the earlier type wins ties.
    pub fn best(&self) -> (DocumentType, i32) {
        let mut best = (DocumentType::Other, 0);
        for (kind, score) in &self.0 {
            if *score > best.1 {
                best = (*kind, *score);
            }
        }
        best
    }
}

#[derive(Debug, Clone)]
pub struct PatternClassifier {
    table: Arc<RuleTable>,
}

impl PatternClassifier {
    pub fn new(table: RuleTable) -> Self {
        Self {
            table: Arc::new(table),
        }
    }

    pub fn with_default_rules() -> Result<Self, regex::Error> {
        Ok(Self::new(RuleTable::legal_defaults()?))
    }

    pub fn scores(&self, text: &str) -> Scores {
        let lowered = text.to_lowercase();
        self.score_lowered(&LoweredText { full: &lowered })
    }

    fn score_lowered(&self, text: &LoweredText<'_>) -> Scores {
        let mut scores = Scores(
            self.table
                .types
                .iter()
                .map(|entry| {
                    let total = entry.rules.iter().map(|rule| rule.score(text)).sum();
                    (entry.document_type, total)
                })
                .collect(),
        );
        for exclusion in &self.table.exclusions {
            exclusion.apply(&mut scores, text);
        }
        scores
    }

    pub fn classify(&self, text: &str) -> Classification {
        let lowered = text.to_lowercase();
        let lowered = LoweredText { full: &lowered };

        let is_administrative = self
            .table
            .administrative
            .iter()
            .any(|(window, pattern)| pattern.is_match(lowered.window(*window)));
        if is_administrative {
            return Classification {
                document_type: DocumentType::Other,
                confidence: self.table.administrative_confidence,
                reasoning: "pattern matching: administrative document".to_string(),
                source: ClassificationSource::Patterns,
            };
        }

        let scores = self.score_lowered(&lowered);
        let (best_type, best_score) = scores.best();
        let confidence = (f64::from(best_score) / self.table.normalizer).min(self.table.max_confidence);
        let document_type = if best_score > self.table.min_score {
            best_type
        } else {
            DocumentType::Other
        };

        Classification {
            document_type,
            confidence,
            reasoning: format!("pattern matching: score {best_score}"),
            source: ClassificationSource::Patterns,
        }
    }
}

const PREVIEW_HEAD: usize = 2_500;
const PREVIEW_MIDDLE: usize = 1_000;
const PREVIEW_TAIL: usize = 1_500;

/// Head, middle and tail excerpts of `text` for the model prompt.
pub fn classification_preview(text: &str) -> String {
    let chars = text.chars().collect::<Vec<_>>();
    let slice = |start: usize, end: usize| {
        let end = end.min(chars.len());
        chars[start.min(end)..end].iter().collect::<String>()
    };

    let middle_start = (chars.len() / 2).saturating_sub(PREVIEW_MIDDLE / 2);
    let tail_start = chars.len().saturating_sub(PREVIEW_TAIL);

    format!(
        "INÍCIO:\n{}\n\n[...]\n\nMEIO:\n{}\n\n[...]\n\nFIM:\n{}",
        slice(0, PREVIEW_HEAD),
        slice(middle_start, middle_start + PREVIEW_MIDDLE),
        slice(tail_start, chars.len())
    )
}

/// Pattern-first classifier with optional model escalation.
pub struct DocumentClassifier {
    patterns: PatternClassifier,
    model: Option<Arc<dyn ModelService>>,
    serializer: CallSerializer,
    timeout: Duration,
}

impl DocumentClassifier {
    pub fn new(
        patterns: PatternClassifier,
        model: Option<Arc<dyn ModelService>>,
        serializer: CallSerializer,
        timeout: Duration,
    ) -> Self {
        Self {
            patterns,
            model,
            serializer,
            timeout,
        }
    }

    pub fn patterns(&self) -> &PatternClassifier {
        &self.patterns
    }

    /// Never fails: model problems degrade to the pattern result.
    pub async fn classify(&self, text: &str) -> Classification {
        let pattern_result = self.patterns.classify(text);

        if pattern_result.confidence >= MODEL_ESCALATION_THRESHOLD {
            info!(
                document_type = %pattern_result.document_type,
                confidence = pattern_result.confidence,
                "classified by patterns"
            );
            return pattern_result;
        }

        if self.model.is_none() {
            debug!(
                document_type = %pattern_result.document_type,
                confidence = pattern_result.confidence,
                "classified by patterns (model not configured)"
            );
            return pattern_result;
        }

        match self.classify_with_model(text).await {
            Ok(classification) => {
                info!(
                    document_type = %classification.document_type,
                    confidence = classification.confidence,
                    "classified by model"
                );
                classification
            }
            Err(error) => {
                warn!(%error, fallback = %pattern_result.document_type, "model classification failed");
                pattern_result
            }
        }
    }

    pub async fn classify_with_model(&self, text: &str) -> Result<Classification, PipelineError> {
        let model = self
            .model
            .clone()
            .ok_or(PipelineError::Classification(ModelError::NotConfigured))?;
        let preview = classification_preview(text);

        let reply = self
            .serializer
            .submit_with_timeout(self.timeout, move || async move { model.classify(&preview).await })
            .await
            .map_err(PipelineError::Classification)?;

        let document_type = reply
            .document_type
            .parse::<DocumentType>()
            .map_err(|error| PipelineError::Classification(ModelError::InvalidOutput(error)))?;
        let confidence = if reply.confidence.is_finite() {
            reply.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };

        Ok(Classification {
            document_type,
            confidence,
            reasoning: reply.reasoning,
            source: ClassificationSource::Model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::RawAnalysis;
    use crate::model::ModelClassification;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn classifier() -> PatternClassifier {
        PatternClassifier::with_default_rules().unwrap()
    }

    struct ScriptedModel {
        reply: Result<ModelClassification, ()>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelService for ScriptedModel {
        async fn extract_text(&self, _bytes: &[u8], _mime_type: &str) -> Result<String, ModelError> {
            Err(ModelError::NotConfigured)
        }

        async fn classify(&self, _preview: &str) -> Result<ModelClassification, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().map_err(|_| ModelError::RateLimited)
        }

        async fn extract_structured(
            &self,
            _text: &str,
            _document_type: DocumentType,
        ) -> Result<RawAnalysis, ModelError> {
            Err(ModelError::NotConfigured)
        }

        async fn generate(&self, _system: &str, _user: &str) -> Result<String, ModelError> {
            Err(ModelError::NotConfigured)
        }
    }

    fn with_model(reply: Result<ModelClassification, ()>) -> (DocumentClassifier, Arc<ScriptedModel>) {
        let model = Arc::new(ScriptedModel {
            reply,
            calls: AtomicUsize::new(0),
        });
        let classifier = DocumentClassifier::new(
            classifier(),
            Some(model.clone() as Arc<dyn ModelService>),
            CallSerializer::unthrottled(),
            Duration::from_secs(5),
        );
        (classifier, model)
    }

    #[test]
    fn judgment_is_recognised_with_high_confidence() {
        let text = "SENTENÇA\n\nVistos. Trata-se de ação de cobrança.\n\nAnte o exposto, julgo procedente o pedido inicial.";
        let result = classifier().classify(text);
        assert_eq!(result.document_type, DocumentType::Judgment);
        assert_eq!(result.document_type.as_str(), "sentenca");
        assert!(result.confidence >= 0.7);
        assert!(result.confidence <= 0.98);
    }

    #[test]
    fn classification_is_deterministic() {
        let text = "CONTRATO DE LOCAÇÃO. Cláusula primeira: o CONTRATANTE pagará ao CONTRATADO.";
        let classifier = classifier();
        let first = classifier.classify(text);
        for _ in 0..5 {
            assert_eq!(classifier.classify(text), first);
        }
        assert_eq!(first.document_type, DocumentType::Contract);
    }

    #[test]
    fn administrative_documents_short_circuit_to_other() {
        let text = "ATA DE ASSEMBLEIA GERAL EXTRAORDINÁRIA. Contrato social e procuração foram discutidos.";
        let result = classifier().classify(text);
        assert_eq!(result.document_type, DocumentType::Other);
        assert!((result.confidence - 0.90).abs() < 1e-9);
    }

    #[test]
    fn legal_opinion_suppresses_judgment_and_order() {
        let text = "PARECER JURÍDICO nº 12/2024\n\nOpina-se que a sentença mencionada e o despacho anterior...";
        let classifier = classifier();
        let scores = classifier.scores(text);
        assert_eq!(scores.get(DocumentType::LegalOpinion), 30 + 10);
        assert_eq!(scores.get(DocumentType::Judgment), 18 - 15);
        assert_eq!(scores.get(DocumentType::CourtOrder), 20 - 15);
        assert_eq!(classifier.classify(text).document_type, DocumentType::LegalOpinion);
    }

    #[test]
    fn opinion_heading_with_ruling_is_a_judgment() {
        let text = "Parecer do Ministério Público acolhido. SENTENÇA. Julgo improcedente o pedido.";
        let classifier = classifier();
        let scores = classifier.scores(text);
        assert!(scores.get(DocumentType::Judgment) > scores.get(DocumentType::LegalOpinion));
        assert_eq!(classifier.classify(text).document_type, DocumentType::Judgment);
    }

    #[test]
    fn contract_suppresses_power_of_attorney() {
        let text = "CONTRATO DE PRESTAÇÃO DE SERVIÇOS. O contratante outorga poderes para o contratado.";
        let scores = classifier().scores(text);
        assert_eq!(scores.get(DocumentType::PowerOfAttorney), 15 - 15);
        assert!(scores.get(DocumentType::Contract) >= 30);
    }

    #[test]
    fn weak_evidence_falls_back_to_other() {
        let result = classifier().classify("Relatório mensal de atividades do escritório.");
        assert_eq!(result.document_type, DocumentType::Other);
        assert_eq!(result.confidence, 0.0);

        let weak = classifier().classify("Favor notar que não procede a cobrança.");
        assert_eq!(weak.document_type, DocumentType::Other);
        assert!((weak.confidence - 0.2).abs() < 1e-9);
    }

    #[test]
    fn head_respects_char_boundaries() {
        assert_eq!(head("ação", 2), "aç");
        assert_eq!(head("ação", 10), "ação");
    }

    #[test]
    fn preview_contains_head_middle_and_tail() {
        let text = format!("{}{}{}", "a".repeat(3_000), "m".repeat(1_000), "z".repeat(3_000));
        let preview = classification_preview(&text);
        assert!(preview.starts_with("INÍCIO:\naaaa"));
        assert!(preview.contains("MEIO:\nmmmm"));
        assert!(preview.ends_with(&"z".repeat(1_500)));
    }

    #[tokio::test]
    async fn confident_pattern_result_skips_the_model() {
        let (classifier, model) = with_model(Ok(ModelClassification {
            document_type: "contrato".to_string(),
            confidence: 0.9,
            reasoning: "model".to_string(),
        }));
        let result = classifier
            .classify("SENTENÇA. Julgo procedente o pedido.")
            .await;
        assert_eq!(result.document_type, DocumentType::Judgment);
        assert_eq!(result.source, ClassificationSource::Patterns);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn low_confidence_escalates_to_model() {
        let (classifier, model) = with_model(Ok(ModelClassification {
            document_type: "procuracao".to_string(),
            confidence: 1.7,
            reasoning: "outorgante e outorgado".to_string(),
        }));
        let result = classifier.classify("Texto sem marcadores claros.").await;
        assert_eq!(result.document_type, DocumentType::PowerOfAttorney);
        assert_eq!(result.source, ClassificationSource::Model);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn model_failure_falls_back_to_patterns() {
        let (classifier, model) = with_model(Err(()));
        let result = classifier.classify("Favor notar que não procede a cobrança.").await;
        assert_eq!(result.source, ClassificationSource::Patterns);
        assert_eq!(result.document_type, DocumentType::Other);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_model_label_falls_back_to_patterns() {
        let (classifier, _) = with_model(Ok(ModelClassification {
            document_type: "memorando".to_string(),
            confidence: 0.8,
            reasoning: String::new(),
        }));
        let result = classifier.classify("Texto curto.").await;
        assert_eq!(result.source, ClassificationSource::Patterns);
    }
}
