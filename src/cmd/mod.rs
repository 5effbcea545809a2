//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled                                  |
//! |----------|---------------------------------------------------|
//! | `spec`   | `Register`, `List`, `Worktrees`, `Status`         |
//! | `build`  | `Build`, `Followup`, `Cancel`, `Qa`, `QaStatus`   |
//! | `review` | `RequestReview`, `Review`, `Approve`, `Reject`,   |
//! |          | `ReviewStatus`                                    |
//! | `merge`  | `Preview`, `Merge`, `Discard`                     |

pub mod build;
pub mod merge;
pub mod review;
pub mod spec;

pub use build::{cmd_build, cmd_cancel, cmd_followup, cmd_qa, cmd_qa_status};
pub use merge::{cmd_discard, cmd_merge, cmd_preview};
pub use review::{cmd_decide, cmd_request_review, cmd_review, cmd_review_status};
pub use spec::{cmd_list, cmd_register, cmd_status, cmd_worktrees};
