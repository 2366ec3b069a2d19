pub mod config;
pub mod dockerfile;
pub mod extracted_image;
pub mod extractor;
pub mod facts;
pub mod java;
pub mod metadata;
pub mod notifier;
pub mod oci_distribution;
pub mod os_release;
pub mod rpm;
pub mod scanner;
pub mod sources;
pub mod tar_extractor;

// Re-exports for easy access
pub use config::{Credentials, ScanOptions};
pub use extracted_image::ExtractedImage;
pub use extractor::{ActionRegistry, ExtractAction, ExtractedLayers};
pub use facts::{Fact, PluginResponse, ScanResult};
pub use notifier::Notifier;
pub use oci_distribution::{construct_oci_distribution_metadata, OciDistributionMetadata};
pub use os_release::TargetOs;
pub use rpm::{NativeRpmCodec, RpmDatabaseCodec};
pub use scanner::Scanner;
pub use sources::{DockerSaveFetcher, ImageArchive, ImageFetcher, ImageType};
