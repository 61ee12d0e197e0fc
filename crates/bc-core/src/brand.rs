//! Branding Constants
//!
//! Single source of truth for product naming and branding.

/// Product display name
pub const PRODUCT_NAME: &str = "Beacon";

/// Directory name used under the platform config dir
pub const CONFIG_DIR_NAME: &str = "beacon";

/// Short description
pub const DESCRIPTION: &str = "Topic-based peer connection front end";
