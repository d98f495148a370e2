use snafu::Snafu;

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type. Every variant here is a startup failure; once
/// the agent is running, nothing propagates this far.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to create client: '{}'", source))]
    ClientCreate { source: kube::Error },

    #[snafu(display("No node name configured; set MECHANIC_NODE_NAME"))]
    MissingNodeName,

    #[snafu(display("Unable to fetch node '{}' on startup: '{}'", node_name, source))]
    FetchNode {
        source: models::node::error::Error,
        node_name: String,
    },

    #[snafu(display("Unable to build the metadata probe: '{}'", source))]
    BuildProbe { source: crate::imds::ImdsError },

    #[snafu(display("Error configuring telemetry: '{}'", source))]
    Telemetry {
        source: models::telemetry::TelemetryConfigError,
    },
}
