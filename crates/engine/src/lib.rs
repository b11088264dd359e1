pub mod announce;
pub mod config;
pub mod coordinator;
pub mod encode;
pub mod ffmpeg;
pub mod ffprobe;
pub mod job;
pub mod probe;
pub mod progress;
pub mod scan;
pub mod sidecar;
pub mod store;

pub use config::EncoderConfig;
pub use coordinator::{EncodingCoordinator, Notice, SubmitReport};
pub use encode::{EncodeEvent, EncodeOutcome, Encoder, FailureCause};
pub use ffmpeg::FfmpegEncoder;
pub use ffprobe::{FFProbeData, FFProbeFormat, FFProbeStream, FfprobeProbe};
pub use job::{Job, JobId, JobStatus};
pub use progress::ProgressTracker;
pub use store::{ChangeKind, ChannelObserver, JobObserver, JobStore, StoreEvent};
