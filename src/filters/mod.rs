pub mod pose_ekf;
pub mod prefilter;
pub mod propagation;
