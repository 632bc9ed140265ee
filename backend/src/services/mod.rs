pub mod audit;
pub mod evidence;
pub mod qa_checklist;

pub use audit::AuditService;
