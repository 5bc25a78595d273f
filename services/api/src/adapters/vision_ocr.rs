//! services/api/src/adapters/vision_ocr.rs
//!
//! Adapters over plain HTTP: the Google Cloud Vision `images:annotate`
//! endpoint (implements `OcrService`) and a raw image downloader (implements
//! `ImageFetcher`).

use async_trait::async_trait;
use base64::Engine as _;
use cv_pipeline_core::ports::{
    ImageFetcher, ImageSource, OcrFeature, OcrRequest, OcrResponse, OcrService, PortError,
    PortResult, TextRegion,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

//=========================================================================================
// Wire types
//=========================================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateBatch {
    requests: Vec<AnnotateImageRequest>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageRequest {
    image: VisionImage,
    features: Vec<VisionFeature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_context: Option<ImageContext>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VisionImage {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<VisionImageSource>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VisionImageSource {
    image_uri: String,
}

#[derive(Serialize)]
struct VisionFeature {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageContext {
    language_hints: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AnnotateBatchResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    #[serde(default)]
    full_text_annotation: Option<FullTextAnnotation>,
    #[serde(default)]
    text_annotations: Vec<EntityAnnotation>,
    #[serde(default)]
    error: Option<VisionStatus>,
}

#[derive(Deserialize)]
struct FullTextAnnotation {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct EntityAnnotation {
    #[serde(default)]
    description: String,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Deserialize)]
struct VisionStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

fn feature_name(feature: OcrFeature) -> &'static str {
    match feature {
        OcrFeature::DocumentText => "DOCUMENT_TEXT_DETECTION",
        OcrFeature::TextDetection => "TEXT_DETECTION",
    }
}

fn build_request(request: &OcrRequest) -> AnnotateBatch {
    let image = match &request.source {
        ImageSource::Uri(uri) => VisionImage {
            content: None,
            source: Some(VisionImageSource {
                image_uri: uri.clone(),
            }),
        },
        ImageSource::Inline(bytes) => VisionImage {
            content: Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
            source: None,
        },
    };
    let image_context = (!request.language_hints.is_empty()).then(|| ImageContext {
        language_hints: request.language_hints.clone(),
    });
    AnnotateBatch {
        requests: vec![AnnotateImageRequest {
            image,
            features: request
                .features
                .iter()
                .map(|f| VisionFeature {
                    kind: feature_name(*f),
                })
                .collect(),
            image_context,
        }],
    }
}

/// Maps the first per-image response to the port shape. A per-image error
/// status is an error even though the HTTP call succeeded.
fn parse_response(body: AnnotateBatchResponse) -> PortResult<OcrResponse> {
    let Some(first) = body.responses.into_iter().next() else {
        return Ok(OcrResponse::default());
    };
    if let Some(status) = first.error.filter(|s| s.code != 0) {
        return Err(match status.code {
            7 | 16 => PortError::Unauthorized,
            8 => PortError::QuotaExceeded(status.message),
            _ => PortError::Unexpected(format!("vision error {}: {}", status.code, status.message)),
        });
    }
    Ok(OcrResponse {
        full_text: first.full_text_annotation.map(|a| a.text),
        regions: first
            .text_annotations
            .into_iter()
            .map(|a| TextRegion {
                description: a.description,
                confidence: a.confidence,
            })
            .collect(),
    })
}

fn classify_status(status: StatusCode, body: String) -> PortError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PortError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => PortError::QuotaExceeded(body),
        StatusCode::NOT_FOUND => PortError::NotFound(body),
        _ => PortError::Unexpected(format!("HTTP {}: {}", status.as_u16(), body)),
    }
}

//=========================================================================================
// Google Cloud Vision
//=========================================================================================

/// An adapter that implements `OcrService` against Google Cloud Vision.
#[derive(Clone)]
pub struct GoogleVisionOcr {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl GoogleVisionOcr {
    /// `client` is shared with the other HTTP adapters.
    pub fn new(client: reqwest::Client, endpoint: &str, api_key: String) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl OcrService for GoogleVisionOcr {
    async fn annotate(&self, request: &OcrRequest) -> PortResult<OcrResponse> {
        let url = format!("{}/v1/images:annotate", self.endpoint);
        let body = build_request(request);

        let response = self
            .client
            .post(&url)
            .query(&[("key", &self.api_key)])
            .json(&body)
            .send()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let parsed: AnnotateBatchResponse = response
            .json()
            .await
            .map_err(|e| PortError::Unexpected(format!("invalid vision response: {e}")))?;
        let result = parse_response(parsed)?;
        debug!(
            full_text_chars = result.full_text.as_deref().map(str::len).unwrap_or(0),
            regions = result.regions.len(),
            "Vision annotate answered."
        );
        Ok(result)
    }
}

//=========================================================================================
// Raw image download
//=========================================================================================

/// An adapter that implements `ImageFetcher` with a plain GET.
#[derive(Clone)]
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch_image(&self, uri: &str) -> PortResult<Vec<u8>> {
        let response = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// The shared HTTP client used by the OCR and download adapters.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, PortError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| PortError::Unexpected(format!("failed to build HTTP client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn uri_request_carries_features_and_hints() {
        let request = OcrRequest {
            source: ImageSource::Uri("https://cdn/page1.jpg".into()),
            features: vec![OcrFeature::DocumentText, OcrFeature::TextDetection],
            language_hints: vec!["es".into(), "en".into()],
        };
        let body = serde_json::to_value(build_request(&request)).unwrap();
        assert_eq!(
            body,
            json!({
                "requests": [{
                    "image": {"source": {"imageUri": "https://cdn/page1.jpg"}},
                    "features": [{"type": "DOCUMENT_TEXT_DETECTION"}, {"type": "TEXT_DETECTION"}],
                    "imageContext": {"languageHints": ["es", "en"]}
                }]
            })
        );
    }

    #[test]
    fn inline_request_is_base64_content() {
        let request = OcrRequest {
            source: ImageSource::Inline(vec![1, 2, 3]),
            features: vec![OcrFeature::DocumentText],
            language_hints: vec![],
        };
        let body = serde_json::to_value(build_request(&request)).unwrap();
        assert_eq!(body["requests"][0]["image"], json!({"content": "AQID"}));
        assert!(body["requests"][0].get("imageContext").is_none());
    }

    #[test]
    fn full_text_and_regions_are_mapped() {
        let body: AnnotateBatchResponse = serde_json::from_value(json!({
            "responses": [{
                "fullTextAnnotation": {"text": "Jane Doe\nEngineer"},
                "textAnnotations": [{"description": "Jane Doe Engineer"}, {"description": "Jane"}]
            }]
        }))
        .unwrap();
        let response = parse_response(body).unwrap();
        assert_eq!(response.full_text.as_deref(), Some("Jane Doe\nEngineer"));
        assert_eq!(response.regions.len(), 2);
    }

    #[test]
    fn empty_response_is_not_an_error() {
        let body: AnnotateBatchResponse = serde_json::from_value(json!({"responses": [{}]})).unwrap();
        assert_eq!(parse_response(body).unwrap(), OcrResponse::default());
    }

    #[test]
    fn per_image_errors_are_classified() {
        let body: AnnotateBatchResponse = serde_json::from_value(json!({
            "responses": [{"error": {"code": 7, "message": "API key not valid"}}]
        }))
        .unwrap();
        assert!(matches!(parse_response(body), Err(PortError::Unauthorized)));

        let body: AnnotateBatchResponse = serde_json::from_value(json!({
            "responses": [{"error": {"code": 3, "message": "Bad image data"}}]
        }))
        .unwrap();
        assert!(matches!(parse_response(body), Err(PortError::Unexpected(_))));
    }

    #[test]
    fn http_statuses_are_classified() {
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, String::new()),
            PortError::Unauthorized
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down".into()),
            PortError::QuotaExceeded(_)
        ));
    }
}
