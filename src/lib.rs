//! # Terraform Registry
//!
//! A self-hosted registry serving as the authoritative source for Terraform
//! reusable modules and providers in an enterprise.
//!
//! ## Overview
//!
//! One long-running server process provides:
//!
//! 1. **Registry protocols** - the public module registry, provider
//!    registry and provider network mirror protocols behind a single HTTP
//!    listener
//! 2. **Artifact ingestion** - archive validation, content-addressed
//!    storage, immutable-version enforcement, checksum discipline
//! 3. **Pluggable object storage** - local filesystem, Azure Blob, S3 and
//!    GCS behind one trait with signed-URL semantics
//! 4. **SCM-triggered publishing** - webhook-authenticated tag pushes from
//!    GitHub, GitLab, Azure DevOps and Bitbucket Data Center become module
//!    versions, at most once per (module, version)
//! 5. **Upstream mirroring** - scheduled pulls from public registries with
//!    GPG and checksum verification, policy evaluation and approval gating
//! 6. **Authentication** - session JWTs and hashed API keys resolved to
//!    scoped principals; every stored secret sealed with AES-256-GCM
//!
//! ## Usage
//!
//! See the [README.md](../README.md) for configuration and deployment
//! instructions.

pub mod api;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod ingest;
pub mod mirror;
pub mod observability;
pub mod publish;
pub mod scm;
pub mod server;
pub mod storage;
