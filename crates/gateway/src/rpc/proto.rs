// Include the generated protobuf code
pub mod lnrpc {
    tonic::include_proto!("lnrpc");
}

pub mod xudrpc {
    tonic::include_proto!("xudrpc");
}

pub mod boltzrpc {
    tonic::include_proto!("boltzrpc");
}
