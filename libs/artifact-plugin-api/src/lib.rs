//! Artifact plugin gRPC protocol
//!
//! Wire messages of the `artifact.ArtifactService` service spoken by artifact
//! plugins over a unix-domain socket. The executor is the client; plugins
//! implement the server side in any language.

/// Fully qualified gRPC service name
pub const SERVICE_NAME: &str = "artifact.ArtifactService";

/// Method paths of the service
pub mod paths {
    pub const LOAD: &str = "/artifact.ArtifactService/Load";
    pub const OPEN_STREAM: &str = "/artifact.ArtifactService/OpenStream";
    pub const SAVE: &str = "/artifact.ArtifactService/Save";
    pub const DELETE: &str = "/artifact.ArtifactService/Delete";
    pub const LIST_OBJECTS: &str = "/artifact.ArtifactService/ListObjects";
    pub const IS_DIRECTORY: &str = "/artifact.ArtifactService/IsDirectory";
}

/// Plugin-specific location of an artifact
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PluginArtifact {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub configuration: String,
    #[prost(int32, tag = "3")]
    pub connection_timeout_seconds: i32,
    #[prost(string, tag = "4")]
    pub key: String,
}

/// Artifact identity as seen by a plugin
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Artifact {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(int32, tag = "3")]
    pub mode: i32,
    #[prost(string, tag = "4")]
    pub from: String,
    #[prost(bool, tag = "5")]
    pub optional: bool,
    #[prost(string, tag = "6")]
    pub sub_path: String,
    #[prost(bool, tag = "7")]
    pub recurse_mode: bool,
    #[prost(string, tag = "8")]
    pub from_expression: String,
    #[prost(bool, tag = "9")]
    pub deleted: bool,
    #[prost(message, optional, tag = "10")]
    pub plugin: Option<PluginArtifact>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoadArtifactRequest {
    #[prost(message, optional, tag = "1")]
    pub input_artifact: Option<Artifact>,
    #[prost(string, tag = "2")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoadArtifactResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OpenStreamRequest {
    #[prost(message, optional, tag = "1")]
    pub artifact: Option<Artifact>,
}

/// One chunk of a streamed artifact
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OpenStreamResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    #[prost(string, tag = "2")]
    pub error: String,
    #[prost(bool, tag = "3")]
    pub is_end: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SaveArtifactRequest {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(message, optional, tag = "2")]
    pub output_artifact: Option<Artifact>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SaveArtifactResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteArtifactRequest {
    #[prost(message, optional, tag = "1")]
    pub artifact: Option<Artifact>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteArtifactResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListObjectsRequest {
    #[prost(message, optional, tag = "1")]
    pub artifact: Option<Artifact>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListObjectsResponse {
    #[prost(string, repeated, tag = "1")]
    pub objects: Vec<String>,
    #[prost(string, tag = "2")]
    pub error: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IsDirectoryRequest {
    #[prost(message, optional, tag = "1")]
    pub artifact: Option<Artifact>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IsDirectoryResponse {
    #[prost(bool, tag = "1")]
    pub is_directory: bool,
    #[prost(string, tag = "2")]
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_stream_chunk_decodes() {
        let chunk = OpenStreamResponse {
            data: b"hello".to_vec(),
            error: String::new(),
            is_end: false,
        };
        let bytes = chunk.encode_to_vec();
        let decoded = OpenStreamResponse::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.data, b"hello");
        assert!(!decoded.is_end);
    }

    #[test]
    fn test_paths_share_service_name() {
        for path in [
            paths::LOAD,
            paths::OPEN_STREAM,
            paths::SAVE,
            paths::DELETE,
            paths::LIST_OBJECTS,
            paths::IS_DIRECTORY,
        ] {
            assert!(path.starts_with(&format!("/{}/", SERVICE_NAME)));
        }
    }
}
