pub mod aggregator;
pub mod config;
pub mod domain;
pub mod error;
pub mod extractor;
pub mod memory;
pub mod orchestrator;
pub mod poll;
pub mod ports;
pub mod queue;
pub mod selector;

pub use config::{AnalysisConfig, Backoff, PipelineConfig, PollPolicy, RetryPolicy, SelectorConfig, TextThresholds};
pub use domain::{
    Document, DocumentStatus, Education, Experience, Language, PageCursor, PersonalInfo,
    StructuredData,
};
pub use error::{PageError, PipelineError};
pub use memory::InMemoryDocumentStore;
pub use orchestrator::{Orchestrator, PageOutcome};
pub use poll::{wait_for_terminal, PollError};
pub use ports::{
    CompletionRequest, DocumentStore, DocumentUpdate, ImageFetcher, ImageSource, LanguageModelService,
    OcrFeature, OcrRequest, OcrResponse, OcrService, PortError, PortResult, TextRegion,
};
pub use queue::{ProcessingJob, ProcessingQueue, SubmitError, MAX_CONCURRENT_RUNS};
pub use selector::{ExtractionMethod, PageExtraction, TextExtractionSelector};
