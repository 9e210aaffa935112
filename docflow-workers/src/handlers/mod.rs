//! Event handlers run by the worker tier.
//!
//! - **Email**: verification, trial expiry and team notifications
//! - **Index**: search index mutations for every index kind
//! - **OCR**: text extraction and folding results into the document index

pub mod email;
pub mod index;
pub mod ocr;

pub use email::{
    TeamInvitationEmailHandler, TeamRemovalEmailHandler, TeamWelcomeEmailHandler,
    TrialExpiryEmailHandler, VerificationEmailHandler,
};
pub use index::IndexMutationHandler;
pub use ocr::{DocumentClassifiedHandler, OcrCompletedHandler, OcrRequestHandler};
