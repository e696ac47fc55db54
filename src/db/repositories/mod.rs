pub mod activities;
pub mod annotations;
pub mod views;
