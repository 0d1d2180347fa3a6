pub mod camera_models;
pub mod incident_models;
pub mod user_models;

pub use camera_models::Camera;
pub use incident_models::Incident;
pub use user_models::User;
