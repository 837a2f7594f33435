// Extractor integration
//
// - traits: the black-box extractor boundary and its typed failures
// - cli: yt-dlp invoked as a subprocess
// - diagnostics: the single stderr -> ErrorKind translation
// - orchestrator: ExtractionClient, the retry cascade

mod cli;
pub mod diagnostics;
mod orchestrator;
mod traits;

pub use cli::YtDlpCli;
pub use diagnostics::classify;
pub use orchestrator::{CascadePosition, ExtractionClient};
pub use traits::{
    AttemptOutcome, AudioConversion, CookieSource, DownloadSpec, ExtractionAttempt, Extractor,
    ExtractorFailure, ExtractorOptions, TransferHook, UserAgentProfile,
};
