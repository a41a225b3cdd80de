//! HTTP client for an OpenAI-compatible chat-completions endpoint, used for
//! OCR, classification, structured extraction and answer generation.

use crate::analysis::RawAnalysis;
use crate::config::{ModelConfig, ModelTimeouts};
use crate::error::ModelError;
use crate::models::DocumentType;
use crate::traits::ModelService;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Characters of document text sent for structured extraction.
pub const STRUCTURED_PROMPT_CHARS: usize = 8_000;

const OCR_PROMPT: &str = "Transcreva todo o texto deste documento jurídico com a maior fidelidade possível.
- Preserve a estrutura original, números de processo, datas, valores, nomes e CPF/CNPJ.
- Transcreva carimbos e assinaturas legíveis.
- Use acentuação correta em UTF-8.
- Responda somente com o texto transcrito, sem comentários.";

const CLASSIFY_SYSTEM: &str = "Você classifica documentos jurídicos brasileiros. Responda apenas com JSON válido.";

const ANALYZE_SYSTEM: &str = "Você extrai informações estruturadas de documentos jurídicos. \
Responda apenas com JSON válido, sem markdown e sem explicações.";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ModelClassification {
    #[serde(rename = "type")]
    pub document_type: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

pub struct ChatCompletionsClient {
    http: Client,
    endpoint: Url,
    api_key: String,
    chat_model: String,
    ocr_model: String,
    timeouts: ModelTimeouts,
}

impl ChatCompletionsClient {
    pub fn new(config: &ModelConfig, timeouts: ModelTimeouts) -> Result<Self, ModelError> {
        let mut base = config.endpoint.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let endpoint = Url::parse(&base)?.join("chat/completions")?;

        Ok(Self {
            http: Client::new(),
            endpoint,
            api_key: config.api_key.clone(),
            chat_model: config.chat_model.clone(),
            ocr_model: config.ocr_model.clone(),
            timeouts,
        })
    }

    async fn complete(&self, body: Value, timeout: Duration) -> Result<String, ModelError> {
        let response = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|error| classify_transport_error(error, timeout))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ModelError::RateLimited);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(ModelError::Unauthorized);
        }
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(ModelError::BackendResponse {
                status: status.as_u16(),
                details: details.chars().take(300).collect(),
            });
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|error| classify_transport_error(error, timeout))?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(ModelError::InvalidOutput("model returned empty content".to_string()));
        }
        Ok(content)
    }
}

fn classify_transport_error(error: reqwest::Error, timeout: Duration) -> ModelError {
    if error.is_timeout() {
        ModelError::Timeout(timeout)
    } else {
        ModelError::Http(error)
    }
}

#[async_trait]
impl ModelService for ChatCompletionsClient {
    async fn extract_text(&self, bytes: &[u8], mime_type: &str) -> Result<String, ModelError> {
        debug!(model = %self.ocr_model, bytes = bytes.len(), "requesting model OCR");
        let data_url = format!("data:{mime_type};base64,{}", STANDARD.encode(bytes));
        let body = json!({
            "model": self.ocr_model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": OCR_PROMPT },
                    { "type": "image_url", "image_url": { "url": data_url } },
                ],
            }],
            "max_tokens": 4096,
            "temperature": 0.1,
        });
        self.complete(body, self.timeouts.ocr).await
    }

    async fn classify(&self, preview: &str) -> Result<ModelClassification, ModelError> {
        let labels = DocumentType::SCORED
            .iter()
            .map(|kind| kind.as_str())
            .chain(std::iter::once(DocumentType::Other.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let prompt = format!(
            "Classifique o documento jurídico abaixo. Trechos do início, meio e fim:\n\n{preview}\n\n\
             Tipos possíveis: {labels}.\n\
             Responda somente com JSON: {{\"type\": \"tipo\", \"confidence\": 0.0-1.0, \"reasoning\": \"palavras-chave encontradas\"}}"
        );
        let body = json!({
            "model": self.chat_model,
            "messages": [
                { "role": "system", "content": CLASSIFY_SYSTEM },
                { "role": "user", "content": prompt },
            ],
            "max_tokens": 300,
            "temperature": 0.05,
            "response_format": { "type": "json_object" },
        });
        let content = self.complete(body, self.timeouts.classification).await?;
        parse_json_reply(&content)
    }

    async fn extract_structured(
        &self,
        text: &str,
        document_type: DocumentType,
    ) -> Result<RawAnalysis, ModelError> {
        let excerpt = text.chars().take(STRUCTURED_PROMPT_CHARS).collect::<String>();
        let prompt = format!(
            "Documento do tipo {document_type}. Extraia apenas informações que aparecem de fato no texto.\n\
             Se algo não estiver no texto use null ou []. Nunca use marcadores como \"[nome]\" ou \"[valor]\" e não invente dados.\n\n\
             Documento:\n{excerpt}\n\n\
             Responda com JSON no formato:\n\
             {{\"summary\": \"...\", \"keyPoints\": [\"...\"], \
             \"partes\": [{{\"tipo\": \"autor|reu|terceiro\", \"nome\": \"...\", \"cpfCnpj\": \"...\"}}], \
             \"advogados\": [{{\"nome\": \"...\", \"oab\": \"...\"}}], \"numeroProcesso\": \"...\", \
             \"datas\": [{{\"tipo\": \"...\", \"data\": \"AAAA-MM-DD\", \"descricao\": \"...\"}}], \
             \"valores\": [{{\"tipo\": \"...\", \"valor\": 0.0}}], \"assunto\": \"...\", \"pedidos\": [\"...\"], \
             \"fundamentosLegais\": [\"...\"], \"vara\": \"...\", \"comarca\": \"...\", \"tribunal\": \"...\"}}"
        );
        let body = json!({
            "model": self.chat_model,
            "messages": [
                { "role": "system", "content": ANALYZE_SYSTEM },
                { "role": "user", "content": prompt },
            ],
            "max_tokens": 2048,
            "temperature": 0.2,
            "response_format": { "type": "json_object" },
        });
        let content = self.complete(body, self.timeouts.structured).await?;
        parse_json_reply(&content)
    }

    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String, ModelError> {
        let body = json!({
            "model": self.chat_model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
            "max_tokens": 1024,
            "temperature": 0.3,
        });
        self.complete(body, self.timeouts.generation).await
    }
}

/// Parses a JSON reply that may be wrapped in a Markdown code fence.
pub fn parse_json_reply<T: DeserializeOwned>(content: &str) -> Result<T, ModelError> {
    let cleaned = strip_code_fence(content);
    serde_json::from_str(cleaned).map_err(|error| {
        let preview = cleaned.chars().take(200).collect::<String>();
        ModelError::InvalidOutput(format!("{error}; reply started with: {preview}"))
    })
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let inner = match trimmed.find("```") {
        Some(open) => {
            let after_open = &trimmed[open + 3..];
            let after_tag = after_open.strip_prefix("json").unwrap_or(after_open);
            match after_tag.find("```") {
                Some(close) => &after_tag[..close],
                None => after_tag,
            }
        }
        None => trimmed,
    };
    inner.trim().trim_matches('`').trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    fn client_for(server: &MockServer) -> ChatCompletionsClient {
        let config = ModelConfig {
            endpoint: format!("{}/v1", server.base_url()),
            api_key: "secret".to_string(),
            chat_model: "chat-test".to_string(),
            ocr_model: "ocr-test".to_string(),
        };
        ChatCompletionsClient::new(&config, ModelTimeouts::default()).expect("client")
    }

    fn completion(content: &str) -> Value {
        json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })
    }

    #[test]
    fn fenced_json_is_unwrapped() {
        let reply = "```json\n{\"type\": \"sentenca\", \"confidence\": 0.9, \"reasoning\": \"julgo\"}\n```";
        let parsed: ModelClassification = parse_json_reply(reply).unwrap();
        assert_eq!(parsed.document_type, "sentenca");
        assert_eq!(parsed.confidence, 0.9);

        let bare: ModelClassification = parse_json_reply("  {\"type\": \"outro\"}  ").unwrap();
        assert_eq!(bare.document_type, "outro");
        assert_eq!(bare.confidence, 0.0);
    }

    #[test]
    fn malformed_json_is_invalid_output() {
        let error = parse_json_reply::<ModelClassification>("not json at all").unwrap_err();
        assert!(matches!(error, ModelError::InvalidOutput(_)));
    }

    #[tokio::test]
    async fn classification_reply_is_parsed() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("authorization", "Bearer secret");
                then.status(200).json_body(completion(
                    "```json\n{\"type\": \"contrato\", \"confidence\": 0.82, \"reasoning\": \"cláusula\"}\n```",
                ));
            })
            .await;

        let reply = client_for(&server).classify("CONTRATO").await.expect("classification");

        mock.assert_async().await;
        assert_eq!(reply.document_type, "contrato");
        assert_eq!(reply.reasoning, "cláusula");
    }

    #[tokio::test]
    async fn too_many_requests_maps_to_rate_limited() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(429).body("slow down");
            })
            .await;

        let error = client_for(&server).generate("system", "user").await.unwrap_err();
        assert!(matches!(error, ModelError::RateLimited));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn unauthorized_and_server_errors_are_distinguished() {
        let server = MockServer::start_async().await;
        let unauthorized = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(401);
            })
            .await;
        let client = client_for(&server);
        assert!(matches!(
            client.generate("s", "u").await.unwrap_err(),
            ModelError::Unauthorized
        ));
        unauthorized.delete_async().await;

        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(502).body("bad gateway");
            })
            .await;
        match client.generate("s", "u").await.unwrap_err() {
            ModelError::BackendResponse { status, details } => {
                assert_eq!(status, 502);
                assert!(details.contains("bad gateway"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ocr_sends_document_as_data_url() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .body_contains("data:image/png;base64,")
                    .body_contains("ocr-test");
                then.status(200).json_body(completion("TEXTO EXTRAÍDO"));
            })
            .await;

        let text = client_for(&server)
            .extract_text(b"\x89PNG fake", "image/png")
            .await
            .expect("ocr text");

        mock.assert_async().await;
        assert_eq!(text, "TEXTO EXTRAÍDO");
    }

    #[tokio::test]
    async fn empty_content_is_invalid_output() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).json_body(completion("   "));
            })
            .await;

        let error = client_for(&server).generate("s", "u").await.unwrap_err();
        assert!(matches!(error, ModelError::InvalidOutput(_)));
    }
}
