pub mod ddpm;
