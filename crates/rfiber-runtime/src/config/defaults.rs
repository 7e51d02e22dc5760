//! Compile-time defaults, generated by build.rs (see `RFB_CONFIG_RS`)

include!(concat!(env!("OUT_DIR"), "/rfb_merged_config.rs"));
