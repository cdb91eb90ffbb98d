//! The invocation pipeline: identity, routing, response tracking, local
//! hosting and transport, run by a pool of workers.

mod handle;
mod hosting;
mod message;
mod routing;
mod runner;
mod step;
mod tracking;

pub use handle::{Completion, PipelineHandle};
pub use message::{Message, MessageContent, MessageId};
pub use tracking::ResponseTracking;

pub(crate) use handle::{Envelope, PipelineTask};
pub(crate) use hosting::HostingStep;
pub(crate) use routing::RoutingStep;
pub(crate) use runner::Pipeline;
pub(crate) use step::{IdentityStep, PipelineStep, TrackingStep, TransportStep};
