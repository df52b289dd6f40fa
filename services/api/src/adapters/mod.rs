pub mod qa_llm;
pub mod renderer;
pub mod transport;

pub use qa_llm::OpenAiAnsweringAdapter;
pub use renderer::{ClientRenderer, RendererDirective};
pub use transport::StagedFileTransport;
