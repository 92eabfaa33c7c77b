pub mod ai_service;
pub mod conversation_service;
pub mod dispatch_service;
pub mod tool_service;
