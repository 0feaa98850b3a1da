//! Resolution of a command's target to a concrete labelable subject.
use thiserror::Error;

use crate::{
    command::Target,
    models::{ReportType, Subject},
};

/// The command cannot be applied to this report's subject.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Unresolvable {
    #[error("cannot apply post labels to {0}")]
    NotAPost(Subject),
    #[error("cannot extract an account DID from {0}")]
    NoAccount(Subject),
}

/// Resolve the subject a command should label.
///
/// A default target follows the report type. Post labels are tied to the exact
/// revision (cid) that was reported.
pub fn resolve(
    target: Target,
    report_type: ReportType,
    subject: &Subject,
) -> Result<Subject, Unresolvable> {
    let effective = match target {
        Target::Default => report_type,
        Target::Post => ReportType::Post,
        Target::Account => ReportType::Account,
    };

    match (effective, subject) {
        (ReportType::Account, &Subject::Account(_)) | (ReportType::Post, &Subject::Post(_)) => {
            Ok(subject.clone())
        }
        (ReportType::Account, &Subject::Post(ref post)) => post
            .author()
            .map(Subject::account)
            .ok_or_else(|| Unresolvable::NoAccount(subject.clone())),
        (ReportType::Account, &Subject::Unsupported) => {
            Err(Unresolvable::NoAccount(subject.clone()))
        }
        (ReportType::Post, _) => Err(Unresolvable::NotAPost(subject.clone())),
    }
}
