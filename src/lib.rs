//! Build-step execution in ephemeral containers over the Docker daemon
//! API.
//!
//! The engine prepares an image for each step (deriving a build image on
//! top of the requested base when needed), creates or adopts a container
//! keyed by a hash of the step's configuration, runs the step's commands
//! inside it, and tears everything down unless the container is kept for
//! reuse. One local or remote daemon endpoint serves all operations;
//! nothing shells out to a `docker` binary.
//!
//! ```rust,ignore
//! use abox::{Engine, EngineConfig, RunSpec};
//!
//! #[tokio::main]
//! async fn main() -> abox::Result<()> {
//!     let engine = Engine::new(EngineConfig::from_env()).await?;
//!     let output = engine
//!         .run_spec(&RunSpec {
//!             run_id: "build-42".to_string(),
//!             image: Some("rust:1.80".to_string()),
//!             commands: vec!["cargo test".to_string()],
//!             ..Default::default()
//!         })
//!         .await?;
//!     assert!(output.success());
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod context;
pub mod daemon;
pub mod distro;
pub mod error;
pub mod image;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod staging;
pub mod tweaks;
pub mod volume;

// Re-exports
pub use cancel::CancelContext;
pub use config::EngineConfig;
pub use context::{OutputSink, RunContext};
pub use daemon::DaemonClient;
pub use distro::{DistroFamily, OsDistribution};
pub use error::{EngineError, Result};
pub use image::{DerivedImageParts, DockerfileSpec, ImageBuilder, PushedDigest};
pub use registry::RegistryAuth;
pub use session::runspec::{
    configure_volumes, run_on_host, CustomImage, Engine, RunOutput, RunSpec,
};
pub use session::{ContainerSession, PortMapping, SessionSettings, SessionState};
pub use staging::StagingArea;
pub use tweaks::{Tweak, TweakBundle, TweakRunner};
pub use volume::{Volume, VolumeApproach, VolumeMode};
