pub mod funding;
pub mod margin;
