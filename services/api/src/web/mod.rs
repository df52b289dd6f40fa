pub mod protocol;
pub mod rest;
pub mod state;
pub mod ws_handler;

// Re-export the handlers to make them easily accessible
// to the binary that will build the web server router.
pub use rest::{
    create_session_handler, download_document_handler, end_session_handler,
    upload_document_handler,
};
pub use ws_handler::ws_handler;
