pub mod stage1_baseline;
pub mod stage2_tuning;
pub mod stage3_plotting;
pub mod stage4_ablation;

pub use stage1_baseline::Stage1Baseline;
pub use stage2_tuning::Stage2Tuning;
pub use stage3_plotting::Stage3Plotting;
pub use stage4_ablation::Stage4Ablation;
