fn main() {
    let method = |name: &str, route: &str, input: &str, output: &str| {
        tonic_build::manual::Method::builder()
            .name(name)
            .route_name(route)
            .input_type(format!("crate::transfer::proto::{input}"))
            .output_type(format!("crate::transfer::proto::{output}"))
            .codec_path("tonic::codec::ProstCodec")
    };
    let service = tonic_build::manual::Service::builder()
        .name("TransferService")
        .package("tagger.v1")
        .method(
            method("pull", "Pull", "TagRequest", "PullResponse")
                .server_streaming()
                .build(),
        )
        .method(
            method("push", "Push", "PushRequest", "PushAck")
                .client_streaming()
                .build(),
        )
        .build();

    tonic_build::manual::Builder::new().compile(&[service]);
}
