//! Core data model definitions shared across veiltrace crates.

pub mod correlation;
pub mod flow;
pub mod relay;
pub mod report;

pub use correlation::{Correlation, CorrelationKind, Evidence, NewCorrelation};
pub use flow::{
    ConfidenceCategory, Flow, FlowKey, Indicators, NewFlow, Transport,
};
pub use relay::{NewRelayNode, RelayFlag, RelayNode};
pub use report::{NewReport, Report};
