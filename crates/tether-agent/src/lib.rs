//! Tether agent core
//!
//! An in-process runtime that loads, verifies, JIT-compiles and
//! executes small user-supplied programs ("codelets") at named
//! instrumentation points ("hooks") embedded in a host application.
//! Codelets observe host state through hook contexts, keep side state
//! in typed maps shared across codelets, and exchange records with
//! external consumers over IO channels.
//!
//! The big pieces:
//! - **Lifecycle** (`lifecycle`): atomically installs and removes
//!   named codeletsets, including map relocation and linked-map
//!   resolution.
//! - **Dispatch** (`hook`): lock-free codelet list swap with
//!   epoch-based reclamation and per-hook latency histograms.
//! - **Maps** (`map`): array, hashmap and per-thread variants plus IO
//!   channel maps.
//! - **Helpers** (`helper`): the numbered table of host calls codelets
//!   reach through relocation slots.
//! - **Seams** (`vm`, `io`): the external verifier/JIT and IO
//!   transport, pinned as traits with bundled reference backends.
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_agent::{Agent, AgentConfig, Hook, HookType};
//!
//! static PACKET_SEEN: Hook = Hook::new("packet_seen", HookType::Monitoring);
//!
//! #[repr(C)]
//! struct PacketCtx { bytes: u64 }
//!
//! let agent = Agent::init(
//!     AgentConfig::default(),
//!     &[&PACKET_SEEN],
//!     Box::new(my_vm_factory),
//! )?;
//!
//! // Hot path, called by the host wherever the hook point lives:
//! PACKET_SEEN.dispatch(&mut PacketCtx { bytes: 1500 });
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod agent;
pub mod codelet;
pub mod codeletset;
pub mod config;
pub mod epoch;
pub mod hash;
pub mod helper;
pub mod hook;
pub mod io;
pub mod lifecycle;
pub mod map;
pub mod mempool;
pub mod perf;
pub mod runtime;
pub mod thread;
pub mod time;
pub mod vm;

pub use agent::{Agent, AgentError, MaintenanceCtx};
pub use config::AgentConfig;
pub use hook::{Hook, HookType, DEFAULT_CTRL_OP};
pub use io::{IoChannel, IoError, LocalTransport, OutputHandler, StreamId, Transport};
pub use lifecycle::LifecycleController;
pub use map::{Map, MapDef, MapType};
pub use perf::{PerfReport, StatsReport};
pub use vm::{CodeletFn, CodeletVm, MapResolver, VmError, VmFactory};

pub use tether_lcm::api::{
    CodeletDesc, CodeletsetLoadReq, CodeletsetUnloadReq, IoChannelDesc, LinkedMapDesc, LoadError,
    UnloadError,
};
