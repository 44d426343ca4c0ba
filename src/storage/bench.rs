//! Timing smoke tests for the hot paths
