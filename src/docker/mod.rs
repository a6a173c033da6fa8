//! Docker integration: framework image generation and the bollard client.

pub mod client;
pub mod dockerfile;

pub use client::{ContainerConfig, DockerClient};
pub use dockerfile::{
    BuildContext, DockerfileBuilder, DockerfileConfig, CONTAINER_BENCHMARK_DIR,
    CONTAINER_INPUT_DIR, CONTAINER_OUTPUT_DIR, CONTAINER_USER_DIR,
};
