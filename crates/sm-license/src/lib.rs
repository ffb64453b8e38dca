pub mod features;
pub mod validator;

pub use features::{tier_features, tier_modules, FeatureCode, LicenseTier, ModuleCode};
pub use validator::{
    hash_license_key, has_feature, has_module, validate_license, LicensePayload,
    ValidationResult, EXPIRATION_GRACE_DAYS,
};
