//! Structured extraction for the analyze stage: model replies are sanitized
//! into typed fields, and a regex heuristic stands in when no model service
//! is configured.

use crate::config::RetryPolicy;
use crate::error::{ModelError, PipelineError};
use crate::models::{
    AnalysisOutcome, DateMention, DocumentType, Lawyer, MonetaryAmount, Party, StructuredFields,
};
use crate::serializer::CallSerializer;
use crate::traits::ModelService;
use chrono::{DateTime, NaiveDate};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const CURRENCY: &str = "BRL";
const SUMMARY_SOURCE_CHARS: usize = 3_000;
const SUMMARY_MAX_CHARS: usize = 500;
const MAX_DATES: usize = 5;
const MAX_AMOUNTS: usize = 5;
const MAX_LAWS: usize = 5;
const MAX_LEGAL_GROUNDS: usize = 10;
const MIN_AMOUNT: f64 = 100.0;
const MAX_AMOUNT: f64 = 999_999_999.0;
const NOTHING_EXTRACTED: &str = "Nenhuma informação estruturada extraída automaticamente";

/// Structured-extraction reply as the model sends it. Values stay loosely
/// typed until [`sanitize_analysis`] coerces them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RawAnalysis {
    pub summary: Value,
    #[serde(rename = "keyPoints")]
    pub key_points: Value,
    #[serde(rename = "partes")]
    pub parties: Value,
    #[serde(rename = "advogados")]
    pub lawyers: Value,
    #[serde(rename = "numeroProcesso")]
    pub process_number: Value,
    #[serde(rename = "datas")]
    pub dates: Value,
    #[serde(rename = "valores")]
    pub amounts: Value,
    #[serde(rename = "assunto")]
    pub subject: Value,
    #[serde(rename = "pedidos")]
    pub requests: Value,
    #[serde(rename = "fundamentosLegais")]
    pub legal_grounds: Value,
    #[serde(rename = "vara")]
    pub court_division: Value,
    #[serde(rename = "comarca")]
    pub district: Value,
    pub tribunal: Value,
}

/// True for values a model emits when it has nothing real to report.
pub fn is_placeholder(value: &str) -> bool {
    let lowered = value.trim().to_lowercase();
    lowered.is_empty()
        || (lowered.contains('[') && lowered.contains(']'))
        || lowered.contains("exemplo")
        || lowered.contains("placeholder")
        || lowered == "null"
        || lowered == "undefined"
        || lowered == "não identificado"
}

fn text_value(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        _ => return None,
    };
    (!is_placeholder(&text)).then_some(text)
}

fn field<'a>(value: &'a Value, key: &str) -> &'a Value {
    value.get(key).unwrap_or(&Value::Null)
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(text_value).collect())
        .unwrap_or_default()
}

fn objects(value: &Value) -> impl Iterator<Item = &Value> {
    value
        .as_array()
        .into_iter()
        .flatten()
        .filter(|item| item.is_object())
}

/// Accepts `YYYY-MM-DD`, `DD/MM/YYYY` and RFC 3339 timestamps.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%d/%m/%Y"))
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(value).ok().map(|moment| moment.date_naive()))
}

/// Parses `1234.5`, `1.234,56` and `R$ 1.234,56`.
pub fn parse_amount(value: &str) -> Option<f64> {
    let cleaned = value
        .trim()
        .trim_start_matches("R$")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>();
    let normalized = if cleaned.contains(',') {
        cleaned.replace('.', "").replace(',', ".")
    } else {
        cleaned
    };
    normalized.parse::<f64>().ok()
}

fn amount_value(value: &Value) -> Option<f64> {
    let amount = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) if !is_placeholder(text) => parse_amount(text),
        _ => None,
    }?;
    (amount.is_finite() && amount > 0.0).then_some(amount)
}

/// Drops placeholders and coerces dates and amounts to typed values,
/// discarding the ones that do not parse.
pub fn sanitize_analysis(raw: RawAnalysis) -> AnalysisOutcome {
    let parties = objects(&raw.parties)
        .filter_map(|party| {
            let name = text_value(field(party, "nome"))?;
            Some(Party {
                role: text_value(field(party, "tipo")).unwrap_or_else(|| "parte".to_string()),
                name,
                tax_id: text_value(field(party, "cpfCnpj")),
            })
        })
        .collect();

    let lawyers = objects(&raw.lawyers)
        .map(|lawyer| Lawyer {
            name: text_value(field(lawyer, "nome")),
            bar_registration: text_value(field(lawyer, "oab")),
        })
        .filter(|lawyer| lawyer.name.is_some() || lawyer.bar_registration.is_some())
        .collect();

    let dates = objects(&raw.dates)
        .filter_map(|mention| {
            let date = text_value(field(mention, "data")).and_then(|value| parse_date(&value))?;
            Some(DateMention {
                kind: text_value(field(mention, "tipo")).unwrap_or_else(|| "outro".to_string()),
                date,
                description: text_value(field(mention, "descricao")).unwrap_or_default(),
            })
        })
        .collect();

    let amounts = objects(&raw.amounts)
        .filter_map(|amount| {
            let value = amount_value(field(amount, "valor"))?;
            Some(MonetaryAmount {
                kind: text_value(field(amount, "tipo")).unwrap_or_else(|| "outro".to_string()),
                value,
                currency: CURRENCY.to_string(),
            })
        })
        .collect();

    AnalysisOutcome {
        fields: StructuredFields {
            parties,
            lawyers,
            process_number: text_value(&raw.process_number),
            dates,
            amounts,
            subject: text_value(&raw.subject),
            requests: string_list(&raw.requests),
            legal_grounds: string_list(&raw.legal_grounds),
            court_division: text_value(&raw.court_division),
            district: text_value(&raw.district),
            tribunal: text_value(&raw.tribunal),
        },
        summary: text_value(&raw.summary),
        key_points: string_list(&raw.key_points),
    }
}

/// Regex-only extraction used when the model service is not configured.
#[derive(Debug, Clone)]
pub struct HeuristicExtractor {
    process_number: Regex,
    plaintiff: Regex,
    defendant: Regex,
    bar_registration: Regex,
    date: Regex,
    amount: Regex,
    law: Regex,
    article: Regex,
    identity_document: Regex,
}

fn insensitive(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

impl HeuristicExtractor {
    pub fn new() -> Result<Self, regex::Error> {
        const NAME: &str = r"([A-ZÁÀÂÃÉÈÊÍÏÓÔÕÖÚÇÑ][a-záàâãéèêíïóôõöúçñ \t]+)";
        Ok(Self {
            process_number: Regex::new(r"(\d{7}-\d{2}\.\d{4}\.\d\.\d{2}\.\d{4})")?,
            plaintiff: insensitive(&format!(r"autor[:\s]+{NAME}"))?,
            defendant: insensitive(&format!(r"r[ée]u[:\s]+{NAME}"))?,
            bar_registration: insensitive(r"OAB[/\s]([A-Z]{2})\s*(\d+)")?,
            date: Regex::new(r"(\d{2})/(\d{2})/(\d{4})")?,
            amount: Regex::new(r"R\$\s*([\d.]+,\d{2})")?,
            law: insensitive(r"Lei\s+n[ºo°]?\s*([\d./]+)")?,
            article: insensitive(r"art(?:igo)?\.?\s*(\d+)")?,
            identity_document: insensitive(r"\b(rg|cpf)\b")?,
        })
    }

    fn is_personal_document(&self, lowered: &str) -> bool {
        ["certidão", "certidao", "nascimento", "casamento", "óbito"]
            .iter()
            .any(|marker| lowered.contains(marker))
            || self.identity_document.is_match(lowered)
    }

    pub fn extract(&self, text: &str) -> AnalysisOutcome {
        let lowered = text.to_lowercase();
        let personal = self.is_personal_document(&lowered);
        let mut fields = StructuredFields {
            process_number: self
                .process_number
                .captures(text)
                .map(|captures| captures[1].to_string()),
            ..StructuredFields::default()
        };

        for (regex, role) in [(&self.plaintiff, "autor"), (&self.defendant, "réu")] {
            if let Some(captures) = regex.captures(text) {
                let name = captures[1].trim().chars().take(100).collect::<String>();
                if !name.is_empty() {
                    fields.parties.push(Party {
                        role: role.to_string(),
                        name,
                        tax_id: None,
                    });
                }
            }
        }

        let mut registrations = BTreeSet::new();
        for captures in self.bar_registration.captures_iter(text) {
            let registration = format!("{}/{}", captures[1].to_uppercase(), &captures[2]);
            if registrations.insert(registration.clone()) {
                fields.lawyers.push(Lawyer {
                    name: None,
                    bar_registration: Some(registration),
                });
            }
        }

        let mut seen_dates = BTreeSet::new();
        for captures in self.date.captures_iter(text) {
            if fields.dates.len() >= MAX_DATES {
                break;
            }
            let (Ok(day), Ok(month), Ok(year)) = (
                captures[1].parse::<u32>(),
                captures[2].parse::<u32>(),
                captures[3].parse::<i32>(),
            ) else {
                continue;
            };
            let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
                continue;
            };
            if seen_dates.insert(date) {
                fields.dates.push(DateMention {
                    kind: "data_mencionada".to_string(),
                    date,
                    description: "Data encontrada no documento".to_string(),
                });
            }
        }

        if !personal {
            self.collect_amounts(text, &mut fields);
            self.collect_legal_grounds(text, &mut fields);
        }
        fields.subject = guess_subject(&lowered, personal);

        let summary = heuristic_summary(text);
        let key_points = heuristic_key_points(&fields);

        AnalysisOutcome {
            fields,
            summary,
            key_points,
        }
    }

    fn collect_amounts(&self, text: &str, fields: &mut StructuredFields) {
        let mut seen = BTreeSet::new();
        for captures in self.amount.captures_iter(text) {
            if fields.amounts.len() >= MAX_AMOUNTS {
                break;
            }
            let raw = captures[1].to_string();
            if !seen.insert(raw.clone()) {
                continue;
            }
            if let Some(value) = parse_amount(&raw) {
                if (MIN_AMOUNT..=MAX_AMOUNT).contains(&value) {
                    fields.amounts.push(MonetaryAmount {
                        kind: "valor_mencionado".to_string(),
                        value,
                        currency: CURRENCY.to_string(),
                    });
                }
            }
        }
    }

    fn collect_legal_grounds(&self, text: &str, fields: &mut StructuredFields) {
        for captures in self.law.captures_iter(text) {
            if fields.legal_grounds.len() >= MAX_LAWS {
                break;
            }
            let law = format!("Lei nº {}", &captures[1]);
            if !fields.legal_grounds.contains(&law) {
                fields.legal_grounds.push(law);
            }
        }
        for captures in self.article.captures_iter(text) {
            if fields.legal_grounds.len() >= MAX_LEGAL_GROUNDS {
                break;
            }
            let article = format!("Artigo {}", &captures[1]);
            if !fields.legal_grounds.contains(&article) {
                fields.legal_grounds.push(article);
            }
        }
    }
}

fn guess_subject(lowered: &str, personal: bool) -> Option<String> {
    let has = |needle: &str| lowered.contains(needle);
    let has_word = |word: &str| {
        lowered
            .split(|c: char| !c.is_alphanumeric())
            .any(|candidate| candidate == word)
    };
    let subject = if personal {
        if has("nascimento") {
            "Certidão de Nascimento"
        } else if has("casamento") {
            "Certidão de Casamento"
        } else if has("óbito") || has("obito") {
            "Certidão de Óbito"
        } else if has("identidade") || has_word("rg") {
            "Documento de Identidade"
        } else if has_word("cpf") {
            "CPF"
        } else {
            "Documento Pessoal"
        }
    } else if has("trabalh") {
        "Direito do Trabalho"
    } else if has("consumidor") {
        "Direito do Consumidor"
    } else if has("civil") {
        "Direito Civil"
    } else if has("criminal") || has("penal") {
        "Direito Penal"
    } else if has("tributár") || has("fiscal") {
        "Direito Tributário"
    } else if has("família") || has("divórcio") {
        "Direito de Família"
    } else if has("empresarial") || has("societário") {
        "Direito Empresarial"
    } else if has("imobiliário") || has("locação") {
        "Direito Imobiliário"
    } else {
        return None;
    };
    Some(subject.to_string())
}

fn heuristic_summary(text: &str) -> Option<String> {
    let source = text.chars().take(SUMMARY_SOURCE_CHARS).collect::<String>();
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.chars().count() > SUMMARY_MAX_CHARS {
        let cut = trimmed.chars().take(SUMMARY_MAX_CHARS - 3).collect::<String>();
        Some(format!("{cut}..."))
    } else {
        Some(trimmed.to_string())
    }
}

fn heuristic_key_points(fields: &StructuredFields) -> Vec<String> {
    let mut points = Vec::new();
    if let Some(number) = &fields.process_number {
        points.push(format!("Processo: {number}"));
    }
    for party in &fields.parties {
        let label = if party.role == "autor" { "Autor" } else { "Réu" };
        points.push(format!("{label}: {}", party.name));
    }
    if !fields.parties.is_empty() {
        points.push(format!("{} parte(s) identificada(s)", fields.parties.len()));
    }
    if !fields.lawyers.is_empty() {
        points.push(format!("{} advogado(s) identificado(s)", fields.lawyers.len()));
    }
    if !fields.amounts.is_empty() {
        points.push(format!("{} valor(es) monetário(s) identificado(s)", fields.amounts.len()));
    }
    if !fields.legal_grounds.is_empty() {
        points.push(format!(
            "{} fundamento(s) legal(is) citado(s)",
            fields.legal_grounds.len()
        ));
    }
    if points.is_empty() {
        points.push(NOTHING_EXTRACTED.to_string());
    }
    points
}

/// The structured-extraction step of the analyze stage.
pub struct StructuredAnalyzer {
    model: Option<Arc<dyn ModelService>>,
    serializer: CallSerializer,
    heuristics: HeuristicExtractor,
    timeout: Duration,
    retry: RetryPolicy,
}

impl StructuredAnalyzer {
    pub fn new(
        model: Option<Arc<dyn ModelService>>,
        serializer: CallSerializer,
        heuristics: HeuristicExtractor,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            model,
            serializer,
            heuristics,
            timeout,
            retry,
        }
    }

    /// Never fails. Without a model the heuristic runs; when every model
    /// attempt fails the outcome is empty.
    pub async fn analyze(&self, text: &str, document_type: DocumentType) -> AnalysisOutcome {
        if self.model.is_none() {
            debug!("structured extraction by heuristics (model not configured)");
            return self.heuristics.extract(text);
        }
        match self.analyze_with_model(text, document_type).await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(%error, "structured extraction degraded to empty result");
                AnalysisOutcome::default()
            }
        }
    }

    pub async fn analyze_with_model(
        &self,
        text: &str,
        document_type: DocumentType,
    ) -> Result<AnalysisOutcome, PipelineError> {
        let model = self
            .model
            .clone()
            .ok_or(PipelineError::StructuredExtraction(ModelError::NotConfigured))?;
        let text: Arc<str> = Arc::from(text);
        let attempts = self.retry.structured_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let model = Arc::clone(&model);
            let text = Arc::clone(&text);
            let reply = self
                .serializer
                .submit_with_timeout(self.timeout, move || async move {
                    model.extract_structured(&text, document_type).await
                })
                .await;

            match reply {
                Ok(raw) => {
                    let outcome = sanitize_analysis(raw);
                    info!(
                        attempt,
                        parties = outcome.fields.parties.len(),
                        dates = outcome.fields.dates.len(),
                        "structured extraction completed"
                    );
                    return Ok(outcome);
                }
                Err(error) if attempt < attempts => {
                    warn!(%error, attempt, "structured extraction attempt failed; retrying");
                    if matches!(error, ModelError::RateLimited) {
                        tokio::time::sleep(self.retry.backoff_for(attempt)).await;
                    }
                }
                Err(error) => return Err(PipelineError::StructuredExtraction(error)),
            }
        }
    }
}
