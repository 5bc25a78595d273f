pub mod analysis_llm;
pub mod db;
pub mod notifying;
pub mod vision_ocr;

pub use analysis_llm::OpenAiAnalysisAdapter;
pub use db::DbAdapter;
pub use notifying::{NotifyingStore, StatusEvent};
pub use vision_ocr::{GoogleVisionOcr, HttpImageFetcher};
