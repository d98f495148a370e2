use snafu::Snafu;

/// The node-operations result type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to get node '{}': '{}'", node_name, source))]
    GetNode {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to cordon node '{}': '{}'", node_name, source))]
    CordonNode {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Node '{}' is still schedulable after a cordon reported success", node_name))]
    CordonNotApplied { node_name: String },

    #[snafu(display("Node '{}' is missing the cordon-ownership label after a cordon reported success", node_name))]
    CordonNotLabeled { node_name: String },

    #[snafu(display("Unable to uncordon node '{}': '{}'", node_name, source))]
    UncordonNode {
        source: kube::Error,
        node_name: String,
    },

    #[snafu(display("Unable to drain node '{}': '{}'", node_name, source))]
    DrainNode {
        source: super::drain::error::DrainError,
        node_name: String,
    },
}
