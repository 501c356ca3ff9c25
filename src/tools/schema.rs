//! JSON schemas advertised to the model, one per tool.

use serde_json::json;

use crate::llm::ToolSpec;

pub const TERMINAL: &str = "terminal";
pub const CREATE_OR_UPDATE_FILES: &str = "createOrUpdateFiles";
pub const READ_FILES: &str = "readFiles";
pub const CREATE_ENV: &str = "createEnv";
pub const CREATE_MONGO_DB: &str = "createMongoDb";
pub const GET_SERVER_URL: &str = "getServerUrl";
pub const UPDATE_DISCOVERY: &str = "updateDiscovery";
pub const UPDATE_SERVER_INFO: &str = "updateServerInfo";
pub const RECORD_TEST_RESULT: &str = "recordTestResult";
pub const RECORD_BUG: &str = "recordBug";
pub const FINISH: &str = "finish";

pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: TERMINAL,
            description: "Run a shell command from the repository root inside the sandbox",
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command to run"}
                },
                "required": ["command"],
                "additionalProperties": false
            }),
        },
        ToolSpec {
            name: CREATE_OR_UPDATE_FILES,
            description: "Create or overwrite files (usually test files) inside the repository",
            parameters: json!({
                "type": "object",
                "properties": {
                    "files": {
                        "type": "array",
                        "minItems": 1,
                        "items": {
                            "type": "object",
                            "properties": {
                                "path": {"type": "string", "description": "Path relative to the repository root"},
                                "content": {"type": "string"}
                            },
                            "required": ["path", "content"],
                            "additionalProperties": false
                        }
                    }
                },
                "required": ["files"],
                "additionalProperties": false
            }),
        },
        ToolSpec {
            name: READ_FILES,
            description: "Read files from the repository",
            parameters: json!({
                "type": "object",
                "properties": {
                    "files": {"type": "array", "minItems": 1, "items": {"type": "string"}}
                },
                "required": ["files"],
                "additionalProperties": false
            }),
        },
        ToolSpec {
            name: CREATE_ENV,
            description: "Write the repository's .env file from key/value pairs",
            parameters: json!({
                "type": "object",
                "properties": {
                    "envVars": {
                        "type": "array",
                        "minItems": 1,
                        "items": {
                            "type": "object",
                            "properties": {
                                "key": {"type": "string"},
                                "value": {"type": "string"}
                            },
                            "required": ["key", "value"],
                            "additionalProperties": false
                        }
                    }
                },
                "required": ["envVars"],
                "additionalProperties": false
            }),
        },
        ToolSpec {
            name: CREATE_MONGO_DB,
            description: "Provision an isolated MongoDB database for this run and put its URI in .env under the given variable name",
            parameters: json!({
                "type": "object",
                "properties": {
                    "envVarName": {"type": "string", "pattern": "^[A-Z_][A-Z0-9_]*$"}
                },
                "required": ["envVarName"],
                "additionalProperties": false
            }),
        },
        ToolSpec {
            name: GET_SERVER_URL,
            description: "Get the public URL for a port the application listens on inside the sandbox",
            parameters: json!({
                "type": "object",
                "properties": {
                    "port": {"type": "integer", "minimum": 1, "maximum": 65535}
                },
                "required": ["port"],
                "additionalProperties": false
            }),
        },
        ToolSpec {
            name: UPDATE_DISCOVERY,
            description: "Record what you learned about the codebase. Every field is optional; send only what you discovered",
            parameters: json!({
                "type": "object",
                "properties": {
                    "entryPoint": {"type": "string"},
                    "framework": {"type": "string"},
                    "moduleType": {"type": "string", "enum": ["commonjs", "module"]},
                    "endpoints": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "method": {"type": "string"},
                                "path": {"type": "string"},
                                "file": {"type": "string"}
                            },
                            "required": ["method", "path", "file"]
                        }
                    },
                    "envVarsNeeded": {"type": "array", "items": {"type": "string"}},
                    "databaseUsed": {"type": "boolean"}
                },
                "additionalProperties": false
            }),
        },
        ToolSpec {
            name: UPDATE_SERVER_INFO,
            description: "Record how the server was started. Every field is optional",
            parameters: json!({
                "type": "object",
                "properties": {
                    "port": {"type": "integer", "minimum": 1, "maximum": 65535},
                    "sandboxUrl": {"type": "string"},
                    "startCommand": {"type": "string"},
                    "isRunning": {"type": "boolean"}
                },
                "additionalProperties": false
            }),
        },
        ToolSpec {
            name: RECORD_TEST_RESULT,
            description: "Record the outcome of running one test file. Call this after each test run",
            parameters: json!({
                "type": "object",
                "properties": {
                    "testFile": {"type": "string"},
                    "testName": {"type": "string"},
                    "status": {"type": "string", "enum": ["PASS", "FAIL", "ERROR"]},
                    "exitCode": {"type": "integer"},
                    "output": {"type": "string"}
                },
                "required": ["testFile", "testName", "status"],
                "additionalProperties": false
            }),
        },
        ToolSpec {
            name: RECORD_BUG,
            description: "Record a bug that a test confirmed, with its root cause and suggested fixes",
            parameters: json!({
                "type": "object",
                "properties": {
                    "testFile": {"type": "string"},
                    "testName": {"type": "string"},
                    "message": {"type": "string"},
                    "sourceFile": {"type": "string"},
                    "rootCause": {"type": "string"},
                    "confidence": {"type": "string", "enum": ["LOW", "MEDIUM", "HIGH"]},
                    "suggestedFixes": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "type": {"type": "string", "enum": ["modify", "new"]},
                                "filePath": {"type": "string"},
                                "existingSnippet": {"type": "string"},
                                "updatedSnippet": {"type": "string"}
                            },
                            "required": ["type", "filePath", "updatedSnippet"],
                            "additionalProperties": false
                        }
                    }
                },
                "required": ["testFile", "message"],
                "additionalProperties": false
            }),
        },
        ToolSpec {
            name: FINISH,
            description: "End the run with a final summary of what was tested and found",
            parameters: json!({
                "type": "object",
                "properties": {
                    "summary": {"type": "string"}
                },
                "required": ["summary"],
                "additionalProperties": false
            }),
        },
    ]
}
