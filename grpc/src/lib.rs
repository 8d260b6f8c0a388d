pub mod direktiv {
    pub mod functions {
        pub mod v1 {
            tonic::include_proto!("direktiv.functions.v1");
        }
    }
}

pub use self::direktiv::functions::v1::*;
