use snafu::Snafu;

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum NvmeError {
    #[snafu(display("File IO error: {}, {}", filename, source))]
    FileIo {
        filename: String,
        source: std::io::Error,
    },
    #[snafu(display("Controller {} is not a fabrics controller", name))]
    NotFabrics { name: String },
    #[snafu(display("Controller with nqn {} not found", nqn))]
    CtrlNotFound { nqn: String },
    #[snafu(display("No NVMe fabrics controllers found"))]
    NoControllers,
    #[snafu(display("NVMe subsystem scan error: {}, {}", path_prefix, source))]
    SubsystemScan {
        source: glob::PatternError,
        path_prefix: String,
    },
    #[snafu(display("{} is not an NVMe namespace device", device))]
    NotNamespace { device: String },
}

impl From<std::io::Error> for NvmeError {
    fn from(source: std::io::Error) -> NvmeError {
        NvmeError::FileIo {
            filename: String::new(),
            source,
        }
    }
}
